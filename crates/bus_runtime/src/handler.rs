//! Message Handlers
//!
//! Every subscriber, whether a closure or a type, is driven through the same
//! asynchronous contract: take a `Message`, return a `HandlerResult`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use bus_types::{HandlerError, HandlerResult, Message};

// ─────────────────────────────────────────────────────────────────────────────
// Handler Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A subscriber callback
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one delivered message
    async fn handle(&self, message: Message) -> HandlerResult;
}

/// Shared, type-erased handler
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Adapter turning an async closure into a `MessageHandler`
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a shared handler
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Run a handler, turning a panic into a `HandlerError`
pub(crate) async fn invoke(handler: &SharedHandler, message: Message) -> HandlerResult {
    catch_panic(handler.handle(message)).await
}

/// Await a handler future, turning a panic into a `HandlerError`
pub(crate) async fn catch_panic<T, Fut>(future: Fut) -> HandlerResult<T>
where
    Fut: Future<Output = HandlerResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!(
            "Handler panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicking_handler_becomes_error() {
        let handler = handler_fn(|_msg: Message| async move {
            if true {
                panic!("exploded");
            }
            Ok(())
        });

        let message = Message::new("a.b", serde_json::Value::Null, 0);
        let err = invoke(&handler, message).await.unwrap_err();
        assert_eq!(err.message, "Handler panicked: exploded");
    }
}

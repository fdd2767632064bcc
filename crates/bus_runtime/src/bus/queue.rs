//! Priority Queue
//!
//! One FIFO per priority tier, drained high → normal → low. Retried messages
//! go to the back of their own tier.

use std::collections::{HashSet, VecDeque};

use bus_types::{Message, Priority, SubscriptionId};

/// A message waiting for delivery
#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub message: Message,
    /// Subscriptions that already accepted this message on an earlier pass
    pub delivered_to: HashSet<SubscriptionId>,
}

impl QueuedMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            delivered_to: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    tiers: [VecDeque<QueuedMessage>; 3],
}

impl MessageQueue {
    pub fn push(&mut self, queued: QueuedMessage) {
        self.tiers[queued.message.priority.tier()].push_back(queued);
    }

    /// Next message in priority order
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove the oldest message of the lowest non-empty tier
    pub fn evict(&mut self) -> Option<QueuedMessage> {
        self.tiers.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.tiers[priority.tier()].len()
    }

    pub fn drain_all(&mut self) -> Vec<QueuedMessage> {
        self.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
    }
}

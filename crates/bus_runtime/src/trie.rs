//! Pattern Trie
//!
//! Structural index over subscription patterns. Each pattern form has its own
//! index because each needs a different traversal:
//!
//! - exact patterns: hash lookup on the full topic string
//! - prefix patterns (`a.b.*`): forward segment trie, collecting along the walk
//! - suffix patterns (`*.b.c`): trie over reversed segments
//! - complex patterns (`a.*.c`): bucketed by segment count, probed by
//!   substituting the wildcard at each internal position
//!
//! A lookup costs O(segments + matches) for exact, prefix and suffix patterns
//! and O(segments²) string work for complex patterns, independent of the total
//! number of subscriptions.

use std::collections::HashMap;

use serde::Serialize;

use bus_types::{
    BusResult, SEGMENT_SEPARATOR, SubscriptionMetadata, TopicPattern, WILDCARD,
};

use crate::{SharedHandler, Subscription};

/// Approximate fixed cost of one trie node or index entry
const NODE_OVERHEAD_BYTES: usize = 64;

/// Approximate fixed cost of one stored subscription
const SUBSCRIPTION_OVERHEAD_BYTES: usize = 96;

// ─────────────────────────────────────────────────────────────────────────────
// Trie Node
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    subscriptions: Vec<Subscription>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscriptions.is_empty()
    }

    fn insert<'a>(&mut self, path: impl Iterator<Item = &'a String>, subscription: Subscription) {
        let mut node = self;
        for segment in path {
            node = node.children.entry(segment.clone()).or_default();
        }
        node.subscriptions.push(subscription);
    }

    /// Remove one subscription below `path`, pruning emptied nodes on the way back
    fn remove(&mut self, path: &[&String], id: &str) -> bool {
        match path.split_first() {
            None => {
                let before = self.subscriptions.len();
                self.subscriptions.retain(|s| s.id != id);
                self.subscriptions.len() != before
            }
            Some((segment, rest)) => {
                let Some(child) = self.children.get_mut(segment.as_str()) else {
                    return false;
                };
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.children.remove(segment.as_str());
                }
                removed
            }
        }
    }

    fn drain_where<F>(&mut self, predicate: &mut F, out: &mut Vec<Subscription>)
    where
        F: FnMut(&Subscription) -> bool,
    {
        drain_vec(&mut self.subscriptions, predicate, out);

        self.children.retain(|_, child| {
            child.drain_where(predicate, out);
            !child.is_empty()
        });
    }

    fn accumulate(&self, depth: usize, stats: &mut TrieStats, depth_sum: &mut usize) {
        for (key, child) in &self.children {
            stats.node_count += 1;
            stats.memory_bytes += NODE_OVERHEAD_BYTES + key.len();
            if !child.subscriptions.is_empty() {
                // Fixed segments plus the wildcard
                let pattern_depth = depth + 2;
                stats.terminal_count += 1;
                stats.max_depth = stats.max_depth.max(pattern_depth);
                *depth_sum += pattern_depth;
            }
            for sub in &child.subscriptions {
                stats.memory_bytes += subscription_bytes(sub);
            }
            child.accumulate(depth + 1, stats, depth_sum);
        }
    }
}

fn subscription_bytes(subscription: &Subscription) -> usize {
    SUBSCRIPTION_OVERHEAD_BYTES + subscription.id.len() + subscription.pattern.as_str().len()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity statistics for a trie
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrieStats {
    /// Trie nodes plus exact/complex index entries
    pub node_count: usize,
    pub subscription_count: usize,
    pub exact_patterns: usize,
    pub prefix_patterns: usize,
    pub suffix_patterns: usize,
    pub complex_patterns: usize,
    /// Distinct patterns holding at least one subscription
    pub terminal_count: usize,
    pub max_depth: usize,
    pub average_depth: f64,
    /// Approximate footprint of the indices
    pub memory_bytes: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern Trie
// ─────────────────────────────────────────────────────────────────────────────

/// Index answering "which subscriptions match this topic"
#[derive(Default)]
pub struct PatternTrie {
    exact: HashMap<String, Vec<Subscription>>,
    prefix: TrieNode,
    suffix: TrieNode,
    /// segment count -> pattern string -> subscriptions
    complex: HashMap<usize, HashMap<String, Vec<Subscription>>>,
    len: usize,
}

impl PatternTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `pattern`, build a subscription for it and index it
    pub fn add_pattern(
        &mut self,
        pattern: &str,
        handler: SharedHandler,
        metadata: SubscriptionMetadata,
    ) -> BusResult<Subscription> {
        let pattern = TopicPattern::parse(pattern)?;
        let subscription = Subscription::new(pattern, handler, metadata);
        self.insert(subscription.clone());
        Ok(subscription)
    }

    /// Index an already-built subscription under its own pattern
    pub fn insert(&mut self, subscription: Subscription) {
        match &subscription.pattern {
            TopicPattern::Exact { topic } => {
                self.exact
                    .entry(topic.clone())
                    .or_default()
                    .push(subscription);
            }
            TopicPattern::Prefix { segments, .. } => {
                let path = segments.clone();
                self.prefix.insert(path.iter(), subscription);
            }
            TopicPattern::Suffix { segments, .. } => {
                let path = segments.clone();
                self.suffix.insert(path.iter().rev(), subscription);
            }
            TopicPattern::Complex { raw, segments, .. } => {
                self.complex
                    .entry(segments.len())
                    .or_default()
                    .entry(raw.clone())
                    .or_default()
                    .push(subscription);
            }
        }
        self.len += 1;
    }

    /// Remove one subscription from the entry for `pattern`
    ///
    /// Returns false if the pattern is invalid or the subscription is absent.
    pub fn remove_pattern(&mut self, pattern: &str, subscription_id: &str) -> bool {
        let Ok(pattern) = TopicPattern::parse(pattern) else {
            return false;
        };

        let removed = match &pattern {
            TopicPattern::Exact { topic } => {
                remove_from_map(&mut self.exact, topic, subscription_id)
            }
            TopicPattern::Prefix { segments, .. } => {
                let path: Vec<&String> = segments.iter().collect();
                self.prefix.remove(&path, subscription_id)
            }
            TopicPattern::Suffix { segments, .. } => {
                let path: Vec<&String> = segments.iter().rev().collect();
                self.suffix.remove(&path, subscription_id)
            }
            TopicPattern::Complex { raw, segments, .. } => {
                let count = segments.len();
                let removed = self
                    .complex
                    .get_mut(&count)
                    .is_some_and(|bucket| remove_from_map(bucket, raw, subscription_id));
                if self.complex.get(&count).is_some_and(HashMap::is_empty) {
                    self.complex.remove(&count);
                }
                removed
            }
        };

        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Remove every subscription accepted by `predicate`, returning them
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<Subscription>
    where
        F: FnMut(&Subscription) -> bool,
    {
        let mut removed = Vec::new();

        self.exact.retain(|_, subs| {
            drain_vec(subs, &mut predicate, &mut removed);
            !subs.is_empty()
        });
        self.prefix.drain_where(&mut predicate, &mut removed);
        self.suffix.drain_where(&mut predicate, &mut removed);
        self.complex.retain(|_, bucket| {
            bucket.retain(|_, subs| {
                drain_vec(subs, &mut predicate, &mut removed);
                !subs.is_empty()
            });
            !bucket.is_empty()
        });

        self.len -= removed.len();
        removed
    }

    /// All subscriptions whose pattern matches `topic`
    pub fn find_matches(&self, topic: &str) -> Vec<Subscription> {
        let segments: Vec<&str> = topic.split(SEGMENT_SEPARATOR).collect();
        let count = segments.len();
        let mut matches = Vec::new();

        if let Some(subs) = self.exact.get(topic) {
            matches.extend(subs.iter().cloned());
        }

        // A prefix pattern with d fixed segments needs at least d + 1 topic segments,
        // so the walk stops one short of the full topic.
        let mut node = &self.prefix;
        for segment in &segments[..count - 1] {
            match node.children.get(*segment) {
                Some(child) => {
                    matches.extend(child.subscriptions.iter().cloned());
                    node = child;
                }
                None => break,
            }
        }

        let mut node = &self.suffix;
        for segment in segments[1..].iter().rev() {
            match node.children.get(*segment) {
                Some(child) => {
                    matches.extend(child.subscriptions.iter().cloned());
                    node = child;
                }
                None => break,
            }
        }

        if count >= 3 {
            if let Some(bucket) = self.complex.get(&count) {
                for wildcard_index in 1..count - 1 {
                    let candidate = segments
                        .iter()
                        .enumerate()
                        .map(|(i, s)| if i == wildcard_index { WILDCARD } else { *s })
                        .collect::<Vec<_>>()
                        .join(".");
                    if let Some(subs) = bucket.get(&candidate) {
                        matches.extend(subs.iter().cloned());
                    }
                }
            }
        }

        matches
    }

    /// Look up one subscription by id
    pub fn get(&self, pattern: &str, subscription_id: &str) -> Option<Subscription> {
        let pattern = TopicPattern::parse(pattern).ok()?;
        let find = |subs: &Vec<Subscription>| subs.iter().find(|s| s.id == subscription_id).cloned();

        match &pattern {
            TopicPattern::Exact { topic } => self.exact.get(topic).and_then(find),
            TopicPattern::Prefix { segments, .. } => {
                descend(&self.prefix, segments.iter()).and_then(|n| find(&n.subscriptions))
            }
            TopicPattern::Suffix { segments, .. } => {
                descend(&self.suffix, segments.iter().rev()).and_then(|n| find(&n.subscriptions))
            }
            TopicPattern::Complex { raw, segments, .. } => self
                .complex
                .get(&segments.len())
                .and_then(|bucket| bucket.get(raw))
                .and_then(find),
        }
    }

    /// Number of indexed subscriptions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Walk all indices and compute capacity statistics
    pub fn stats(&self) -> TrieStats {
        let mut stats = TrieStats::default();
        let mut depth_sum = 0usize;

        for (topic, subs) in &self.exact {
            let depth = topic.split(SEGMENT_SEPARATOR).count();
            stats.node_count += 1;
            stats.terminal_count += 1;
            stats.exact_patterns += 1;
            stats.max_depth = stats.max_depth.max(depth);
            stats.memory_bytes += NODE_OVERHEAD_BYTES + topic.len();
            stats.memory_bytes += subs.iter().map(subscription_bytes).sum::<usize>();
            depth_sum += depth;
        }

        let before = stats.terminal_count;
        self.prefix.accumulate(0, &mut stats, &mut depth_sum);
        stats.prefix_patterns = stats.terminal_count - before;

        let before = stats.terminal_count;
        self.suffix.accumulate(0, &mut stats, &mut depth_sum);
        stats.suffix_patterns = stats.terminal_count - before;

        for (count, bucket) in &self.complex {
            for (raw, subs) in bucket {
                stats.node_count += 1;
                stats.terminal_count += 1;
                stats.complex_patterns += 1;
                stats.max_depth = stats.max_depth.max(*count);
                stats.memory_bytes += NODE_OVERHEAD_BYTES + raw.len();
                stats.memory_bytes += subs.iter().map(subscription_bytes).sum::<usize>();
                depth_sum += count;
            }
        }

        stats.subscription_count = self.len;
        if stats.terminal_count > 0 {
            stats.average_depth = depth_sum as f64 / stats.terminal_count as f64;
        }
        stats
    }

    /// Drop every index
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn descend<'a, 'b>(
    root: &'a TrieNode,
    path: impl Iterator<Item = &'b String>,
) -> Option<&'a TrieNode> {
    let mut node = root;
    for segment in path {
        node = node.children.get(segment)?;
    }
    Some(node)
}

fn remove_from_map(map: &mut HashMap<String, Vec<Subscription>>, key: &str, id: &str) -> bool {
    let Some(subs) = map.get_mut(key) else {
        return false;
    };
    let before = subs.len();
    subs.retain(|s| s.id != id);
    let removed = subs.len() != before;
    if subs.is_empty() {
        map.remove(key);
    }
    removed
}

fn drain_vec<F>(subs: &mut Vec<Subscription>, predicate: &mut F, out: &mut Vec<Subscription>)
where
    F: FnMut(&Subscription) -> bool,
{
    let (removed, kept): (Vec<_>, Vec<_>) =
        std::mem::take(subs).into_iter().partition(|s| predicate(s));
    *subs = kept;
    out.extend(removed);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use bus_types::{BusError, Message};

    fn noop() -> SharedHandler {
        handler_fn(|_msg: Message| async move { Ok(()) })
    }

    fn add(trie: &mut PatternTrie, pattern: &str) -> Subscription {
        trie.add_pattern(pattern, noop(), SubscriptionMetadata::default())
            .unwrap()
    }

    fn matched_patterns(trie: &PatternTrie, topic: &str) -> Vec<String> {
        let mut patterns: Vec<String> = trie
            .find_matches(topic)
            .into_iter()
            .map(|s| s.pattern.as_str().to_string())
            .collect();
        patterns.sort();
        patterns
    }

    #[test]
    fn test_each_pattern_form() {
        let mut trie = PatternTrie::new();
        add(&mut trie, "user.profile.update");
        add(&mut trie, "user.*");
        add(&mut trie, "*.update");
        add(&mut trie, "user.*.update");
        add(&mut trie, "admin.*");

        assert_eq!(
            matched_patterns(&trie, "user.profile.update"),
            vec!["*.update", "user.*", "user.*.update", "user.profile.update"]
        );
        assert_eq!(matched_patterns(&trie, "user.login"), vec!["user.*"]);
        assert_eq!(
            matched_patterns(&trie, "user.profile.photo.update"),
            vec!["*.update", "user.*"]
        );
        assert!(matched_patterns(&trie, "user").is_empty());
        assert!(matched_patterns(&trie, "billing.created").is_empty());
    }

    #[test]
    fn test_segment_boundaries_align() {
        let mut trie = PatternTrie::new();
        add(&mut trie, "order.*");
        add(&mut trie, "*.created");

        assert!(matched_patterns(&trie, "orders.created.x").is_empty());
        assert_eq!(matched_patterns(&trie, "order.created"), vec!["*.created", "order.*"]);
        assert!(matched_patterns(&trie, "order.recreated").contains(&"order.*".to_string()));
        assert!(!matched_patterns(&trie, "order.recreated").contains(&"*.created".to_string()));
    }

    #[test]
    fn test_lookup_agrees_with_reference_matcher() {
        let patterns = [
            "a", "a.b", "a.b.c", "a.*", "a.b.*", "b.*", "*.c", "*.b.c", "*.a", "a.*.c",
            "a.*.d", "x.*.y.z", "x.y.*.z", "a.b.c.d",
        ];
        let topics = [
            "a", "a.b", "a.b.c", "a.x.c", "a.b.c.d", "x.y.q.z", "x.q.y.z", "b.a", "c",
            "q.b.c", "a.b.d",
        ];

        let mut trie = PatternTrie::new();
        for pattern in patterns {
            add(&mut trie, pattern);
        }

        for topic in topics {
            let mut expected: Vec<String> = patterns
                .iter()
                .filter(|p| TopicPattern::parse(p).unwrap().matches(topic))
                .map(|p| p.to_string())
                .collect();
            expected.sort();
            assert_eq!(matched_patterns(&trie, topic), expected, "topic '{}'", topic);
        }
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let mut trie = PatternTrie::new();
        for pattern in ["*", "a.*.*", "a..b", "a*"] {
            let result = trie.add_pattern(pattern, noop(), SubscriptionMetadata::default());
            assert!(matches!(result, Err(BusError::InvalidPattern { .. })));
        }
        assert!(trie.is_empty());
    }

    #[test]
    fn test_add_then_remove_restores_state() {
        let mut trie = PatternTrie::new();
        add(&mut trie, "user.*");
        add(&mut trie, "order.created");
        let baseline = trie.stats();
        let baseline_matches = matched_patterns(&trie, "user.profile.update");

        let subs: Vec<Subscription> = ["user.profile.*", "*.profile.update", "user.*.update", "user.profile.update"]
            .into_iter()
            .map(|p| add(&mut trie, p))
            .collect();
        assert_ne!(trie.stats(), baseline);

        for sub in &subs {
            assert!(trie.remove_pattern(sub.pattern.as_str(), &sub.id));
        }

        assert_eq!(trie.stats(), baseline);
        assert_eq!(matched_patterns(&trie, "user.profile.update"), baseline_matches);
    }

    #[test]
    fn test_remove_missing_returns_false() {
        let mut trie = PatternTrie::new();
        let sub = add(&mut trie, "a.b.*");
        assert!(!trie.remove_pattern("a.b.*", "nope"));
        assert!(!trie.remove_pattern("a.c.*", &sub.id));
        assert!(!trie.remove_pattern("*", &sub.id));
        assert!(trie.remove_pattern("a.b.*", &sub.id));
        assert!(!trie.remove_pattern("a.b.*", &sub.id));
        assert_eq!(trie.stats(), TrieStats::default());
    }

    #[test]
    fn test_remove_where_by_plugin() {
        let mut trie = PatternTrie::new();
        let meta = SubscriptionMetadata::for_plugin("weather");
        trie.add_pattern("weather.*", noop(), meta.clone()).unwrap();
        trie.add_pattern("*.forecast", noop(), meta.clone()).unwrap();
        trie.add_pattern("weather.today", noop(), meta).unwrap();
        add(&mut trie, "weather.*");

        let removed = trie.remove_where(|s| s.is_owned_by("weather"));
        assert_eq!(removed.len(), 3);
        assert_eq!(trie.len(), 1);
        assert_eq!(matched_patterns(&trie, "weather.today"), vec!["weather.*"]);
        assert!(matched_patterns(&trie, "city.forecast").is_empty());
    }

    #[test]
    fn test_stats() {
        let mut trie = PatternTrie::new();
        add(&mut trie, "a.b.c");
        add(&mut trie, "a.b.*");
        add(&mut trie, "*.c");
        add(&mut trie, "a.*.c");

        let stats = trie.stats();
        assert_eq!(stats.subscription_count, 4);
        assert_eq!(stats.terminal_count, 4);
        assert_eq!(stats.exact_patterns, 1);
        assert_eq!(stats.prefix_patterns, 1);
        assert_eq!(stats.suffix_patterns, 1);
        assert_eq!(stats.complex_patterns, 1);
        // exact entry + 2 prefix nodes + 1 suffix node + complex entry
        assert_eq!(stats.node_count, 5);
        assert_eq!(stats.max_depth, 3);
        assert!((stats.average_depth - 2.75).abs() < f64::EPSILON);
        assert!(stats.memory_bytes > 0);

        trie.clear();
        assert_eq!(trie.stats(), TrieStats::default());
    }

    #[test]
    fn test_get_by_id() {
        let mut trie = PatternTrie::new();
        let sub = add(&mut trie, "*.b.c");
        assert_eq!(trie.get("*.b.c", &sub.id).map(|s| s.id), Some(sub.id.clone()));
        assert!(trie.get("*.b.c", "other").is_none());
    }
}

use std::collections::HashMap;

use tracing::debug;

use huddle_core::types::ConversationKey;

/// Unread counts per conversation, plus which conversation is on screen. The
/// active conversation always reads zero.
#[derive(Debug, Default)]
pub struct UnreadCounter {
    counts: HashMap<ConversationKey, u32>,
    active: Option<ConversationKey>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one inbound message. Returns whether the count moved.
    pub fn record_inbound(&mut self, key: &ConversationKey, from_self: bool) -> bool {
        if from_self || self.active.as_ref() == Some(key) {
            return false;
        }
        let count = self.counts.entry(key.clone()).or_default();
        *count = count.saturating_add(1);
        true
    }

    /// Makes `key` the active conversation and clears its count. Returns
    /// whether the active conversation changed.
    pub fn activate(&mut self, key: ConversationKey) -> bool {
        self.counts.remove(&key);
        if self.active.as_ref() == Some(&key) {
            return false;
        }
        debug!(%key, "active conversation changed");
        self.active = Some(key);
        true
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    /// Takes the hub's counts wholesale.
    pub fn replace_all(&mut self, snapshot: impl IntoIterator<Item = (ConversationKey, u32)>) {
        self.counts = snapshot
            .into_iter()
            .filter(|(key, count)| *count > 0 && self.active.as_ref() != Some(key))
            .collect();
    }

    pub fn count(&self, key: &ConversationKey) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Non-zero counts only.
    pub fn counts(&self) -> HashMap<ConversationKey, u32> {
        self.counts.clone()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().map(|count| u64::from(*count)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ConversationKey {
        ConversationKey::from(raw)
    }

    #[test]
    fn counts_messages_outside_the_active_conversation() {
        let mut unread = UnreadCounter::new();
        unread.activate(key("u2"));

        assert!(unread.record_inbound(&key("u3"), false));
        assert!(!unread.record_inbound(&key("u2"), false));

        assert_eq!(unread.count(&key("u3")), 1);
        assert_eq!(unread.count(&key("u2")), 0);
        assert_eq!(unread.total(), 1);
    }

    #[test]
    fn own_messages_never_count() {
        let mut unread = UnreadCounter::new();
        assert!(!unread.record_inbound(&key("u2"), true));
        assert_eq!(unread.total(), 0);
    }

    #[test]
    #[tracing_test::traced_test]
    fn activation_clears_only_the_activated_key() {
        let mut unread = UnreadCounter::new();
        unread.record_inbound(&key("u2"), false);
        unread.record_inbound(&key("u2"), false);
        unread.record_inbound(&key("u3"), false);

        assert!(unread.activate(key("u2")));
        assert!(!unread.activate(key("u2")));

        assert_eq!(unread.count(&key("u2")), 0);
        assert_eq!(unread.count(&key("u3")), 1);
        assert_eq!(unread.active(), Some(&key("u2")));
        assert!(logs_contain("active conversation changed"));
    }

    #[test]
    fn snapshot_replaces_counts_but_not_the_active_zero() {
        let mut unread = UnreadCounter::new();
        unread.record_inbound(&key("u9"), false);
        unread.activate(key("u2"));

        unread.replace_all([(key("u2"), 4), (key("u3"), 2), (key("g1"), 0)]);

        assert_eq!(unread.count(&key("u2")), 0);
        assert_eq!(unread.count(&key("u3")), 2);
        assert_eq!(unread.count(&key("u9")), 0);
        assert_eq!(unread.counts(), HashMap::from([(key("u3"), 2)]));
    }
}

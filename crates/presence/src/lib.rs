use std::collections::BTreeMap;

use tracing::debug;

use huddle_core::types::OnlineUser;

pub mod typing;

pub use typing::{TypingSignal, TypingTracker};

/// Who the hub reports as online, keyed by user id, plus the hub's own
/// headcount. The two are pushed separately and need not agree.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: BTreeMap<String, OnlineUser>,
    online_count: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the roster changed.
    pub fn mark_online(&mut self, user: OnlineUser) -> bool {
        if self.online.get(&user.user_id) == Some(&user) {
            return false;
        }
        debug!(user_id = %user.user_id, "user online");
        self.online.insert(user.user_id.clone(), user);
        true
    }

    /// Returns whether the roster changed.
    pub fn mark_offline(&mut self, user_id: &str) -> bool {
        let removed = self.online.remove(user_id).is_some();
        if removed {
            debug!(user_id, "user offline");
        }
        removed
    }

    /// Replaces the roster. A user listed twice keeps the last entry.
    pub fn set_full_roster(&mut self, users: impl IntoIterator<Item = OnlineUser>) -> usize {
        self.online = users
            .into_iter()
            .map(|user| (user.user_id.clone(), user))
            .collect();
        debug!(online = self.online.len(), "roster replaced");
        self.online.len()
    }

    /// Returns whether the count changed.
    pub fn set_online_count(&mut self, count: u64) -> bool {
        let changed = self.online_count != count;
        self.online_count = count;
        changed
    }

    pub fn online_count(&self) -> u64 {
        self.online_count
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }

    /// Online users ordered by user id.
    pub fn users(&self) -> Vec<OnlineUser> {
        self.online.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.online_count = 0;
    }
}

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use huddle_core::config::StoreConfig;
use huddle_core::types::{ConversationKey, Message};

#[derive(Debug, Default)]
struct Conversation {
    messages: VecDeque<Message>,
    ids: HashSet<String>,
    /// Trailing messages that arrived live; everything before them came from
    /// history.
    live: usize,
}

/// Ordered messages per conversation, oldest first. Ids are unique within a
/// conversation no matter how often the hub replays them.
#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationKey, Conversation>,
    retention: Option<usize>,
}

impl MessageStore {
    /// `retention` bounds how many live messages a conversation keeps.
    /// Merged history is never evicted. `None` keeps everything.
    pub fn new(retention: Option<usize>) -> Self {
        Self {
            conversations: HashMap::new(),
            retention: retention.filter(|limit| *limit > 0),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.retention())
    }

    /// Appends a live message under its conversation key. Returns `false` for
    /// an id that conversation already holds.
    pub fn append(&mut self, message: Message) -> bool {
        let conversation = self
            .conversations
            .entry(message.conversation_key.clone())
            .or_default();
        if conversation.ids.contains(&message.id) {
            trace!(id = %message.id, key = %message.conversation_key, "duplicate live message");
            return false;
        }

        conversation.ids.insert(message.id.clone());
        conversation.messages.push_back(message);
        conversation.live += 1;

        if let Some(limit) = self.retention {
            while conversation.live > limit {
                let oldest_live = conversation.messages.len() - conversation.live;
                if let Some(evicted) = conversation.messages.remove(oldest_live) {
                    conversation.ids.remove(&evicted.id);
                }
                conversation.live -= 1;
            }
        }
        true
    }

    /// Prepends the messages of a history page that the conversation does not
    /// hold yet, ordered by timestamp. Merging the same page twice adds
    /// nothing the second time. Returns how many were added.
    pub fn merge_history(&mut self, key: &ConversationKey, page: Vec<Message>) -> usize {
        let conversation = self.conversations.entry(key.clone()).or_default();

        let mut fresh: Vec<Message> = page
            .into_iter()
            .filter(|message| conversation.ids.insert(message.id.clone()))
            .map(|mut message| {
                message.conversation_key = key.clone();
                message
            })
            .collect();
        fresh.sort_by_key(|message| message.timestamp);

        let added = fresh.len();
        for message in fresh.into_iter().rev() {
            conversation.messages.push_front(message);
        }
        debug!(%key, added, total = conversation.messages.len(), "merged history page");
        added
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.conversations
            .get(key)
            .map(|conversation| conversation.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &ConversationKey, id: &str) -> bool {
        self.conversations
            .get(key)
            .is_some_and(|conversation| conversation.ids.contains(id))
    }

    /// Keys holding at least one message, sorted.
    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<ConversationKey> = self
            .conversations
            .iter()
            .filter(|(_, conversation)| !conversation.messages.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// The conversation a 1:1 message belongs to, seen from the local user: the
/// recipient when we sent it, the sender otherwise.
pub fn resolve_private_key(
    local_user_id: &str,
    from_user_id: &str,
    to_user_id: &str,
) -> ConversationKey {
    if from_user_id == local_user_id {
        ConversationKey::from(to_user_id)
    } else {
        ConversationKey::from(from_user_id)
    }
}

//! Hub wire protocol.
//!
//! Frames are JSON text messages. The hub pushes named events and completes
//! invocations; the client sends invocations, optionally carrying an id when it
//! wants a completion back. Event names are only looked at here: everything
//! past [`InboundEvent::decode`] works on the closed [`InboundEvent`] union.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use huddle_core::types::OnlineUser;

use crate::error::HubError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Event {
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The hub is closing the connection.
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerFrame {
    pub fn from_json(raw: &str) -> Result<Self, HubError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Invocation {
        /// Absent for fire-and-forget sends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<u64>,
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
}

impl ClientFrame {
    pub fn invocation(invocation_id: Option<u64>, call: &HubCall) -> Self {
        Self::Invocation {
            invocation_id,
            target: call.target().to_string(),
            arguments: call.arguments(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, HubError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPayload {
    pub user_id: String,
    pub username: String,
}

/// A 1:1 message, echoed to the sender and delivered to the recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessagePayload {
    pub id: String,
    pub from_user_id: String,
    pub from_username: String,
    pub to_user_id: String,
    #[serde(alias = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagePayload {
    pub id: String,
    pub from_user_id: String,
    pub from_username: String,
    pub group_id: String,
    #[serde(alias = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub from_user_id: String,
    pub from_username: String,
    #[serde(alias = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistoryPayload {
    pub with_user_id: String,
    pub messages: Vec<HistoryEntry>,
    #[serde(default)]
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHistoryPayload {
    pub group_id: String,
    pub messages: Vec<HistoryEntry>,
    #[serde(default)]
    pub page: u32,
}

/// Every event the hub can push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    IdentityEstablished(IdentityPayload),
    PrivateMessage(PrivateMessagePayload),
    GroupMessage(GroupMessagePayload),
    ConversationHistory(ConversationHistoryPayload),
    GroupHistory(GroupHistoryPayload),
    UserOnline(OnlineUser),
    UserOffline(OnlineUser),
    FullRoster(Vec<OnlineUser>),
    PresenceCount(u64),
    UnreadSnapshot(HashMap<String, u32>),
    Typing { username: String },
    StopTyping,
}

impl InboundEvent {
    pub fn decode(target: &str, arguments: Vec<Value>) -> Result<Self, HubError> {
        let mut arguments = arguments.into_iter();
        let event = match target {
            "ConnectedAs" => Self::IdentityEstablished(argument(target, &mut arguments)?),
            "ReceiveMessage" => Self::PrivateMessage(argument(target, &mut arguments)?),
            "ReceiveGroupMessage" => Self::GroupMessage(argument(target, &mut arguments)?),
            "ConversationHistory" => Self::ConversationHistory(argument(target, &mut arguments)?),
            "GroupHistory" => Self::GroupHistory(argument(target, &mut arguments)?),
            "UserOnline" => Self::UserOnline(argument(target, &mut arguments)?),
            "UserOffline" => Self::UserOffline(argument(target, &mut arguments)?),
            "OnlineUsers" => Self::FullRoster(argument(target, &mut arguments)?),
            "UpdateUserCount" => Self::PresenceCount(argument(target, &mut arguments)?),
            "UnreadCounts" => Self::UnreadSnapshot(argument(target, &mut arguments)?),
            "UserTyping" => Self::Typing {
                username: argument(target, &mut arguments)?,
            },
            "UserStopTyping" => Self::StopTyping,
            other => {
                return Err(HubError::MalformedPayload(format!(
                    "unknown event target {other:?}"
                )));
            }
        };
        Ok(event)
    }

    pub fn target(&self) -> &'static str {
        match self {
            Self::IdentityEstablished(_) => "ConnectedAs",
            Self::PrivateMessage(_) => "ReceiveMessage",
            Self::GroupMessage(_) => "ReceiveGroupMessage",
            Self::ConversationHistory(_) => "ConversationHistory",
            Self::GroupHistory(_) => "GroupHistory",
            Self::UserOnline(_) => "UserOnline",
            Self::UserOffline(_) => "UserOffline",
            Self::FullRoster(_) => "OnlineUsers",
            Self::PresenceCount(_) => "UpdateUserCount",
            Self::UnreadSnapshot(_) => "UnreadCounts",
            Self::Typing { .. } => "UserTyping",
            Self::StopTyping => "UserStopTyping",
        }
    }

    /// Wire form of this event, as the hub would push it.
    pub fn to_frame(&self) -> Result<ServerFrame, HubError> {
        let arguments = match self {
            Self::IdentityEstablished(payload) => vec![serde_json::to_value(payload)?],
            Self::PrivateMessage(payload) => vec![serde_json::to_value(payload)?],
            Self::GroupMessage(payload) => vec![serde_json::to_value(payload)?],
            Self::ConversationHistory(payload) => vec![serde_json::to_value(payload)?],
            Self::GroupHistory(payload) => vec![serde_json::to_value(payload)?],
            Self::UserOnline(user) | Self::UserOffline(user) => vec![serde_json::to_value(user)?],
            Self::FullRoster(users) => vec![serde_json::to_value(users)?],
            Self::PresenceCount(count) => vec![Value::from(*count)],
            Self::UnreadSnapshot(counts) => vec![serde_json::to_value(counts)?],
            Self::Typing { username } => vec![Value::from(username.as_str())],
            Self::StopTyping => Vec::new(),
        };
        Ok(ServerFrame::Event {
            target: self.target().to_string(),
            arguments,
        })
    }
}

/// Every operation the client can invoke on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCall {
    SendPrivateMessage { to_user_id: String, body: String },
    SendGroupMessage { group_id: String, body: String },
    RequestConversationHistory { with_user_id: String, page: u32 },
    RequestGroupHistory { group_id: String, page: u32 },
    RequestOnlineUsers,
    NotifyTyping { to_user_id: String },
    NotifyStopTyping { to_user_id: String },
}

impl HubCall {
    pub fn target(&self) -> &'static str {
        match self {
            Self::SendPrivateMessage { .. } => "SendPrivateMessage",
            Self::SendGroupMessage { .. } => "SendGroupMessage",
            Self::RequestConversationHistory { .. } => "GetConversationHistory",
            Self::RequestGroupHistory { .. } => "GetGroupHistory",
            Self::RequestOnlineUsers => "GetOnlineUsers",
            Self::NotifyTyping { .. } => "NotifyTyping",
            Self::NotifyStopTyping { .. } => "NotifyStopTyping",
        }
    }

    pub fn arguments(&self) -> Vec<Value> {
        match self {
            Self::SendPrivateMessage { to_user_id, body } => {
                vec![Value::from(to_user_id.as_str()), Value::from(body.as_str())]
            }
            Self::SendGroupMessage { group_id, body } => {
                vec![Value::from(group_id.as_str()), Value::from(body.as_str())]
            }
            Self::RequestConversationHistory { with_user_id, page } => {
                vec![Value::from(with_user_id.as_str()), Value::from(*page)]
            }
            Self::RequestGroupHistory { group_id, page } => {
                vec![Value::from(group_id.as_str()), Value::from(*page)]
            }
            Self::RequestOnlineUsers => Vec::new(),
            Self::NotifyTyping { to_user_id } | Self::NotifyStopTyping { to_user_id } => {
                vec![Value::from(to_user_id.as_str())]
            }
        }
    }

    /// Parses an invocation back into a call, as the hub side sees it.
    pub fn decode(target: &str, arguments: Vec<Value>) -> Result<Self, HubError> {
        let mut arguments = arguments.into_iter();
        let call = match target {
            "SendPrivateMessage" => Self::SendPrivateMessage {
                to_user_id: argument(target, &mut arguments)?,
                body: argument(target, &mut arguments)?,
            },
            "SendGroupMessage" => Self::SendGroupMessage {
                group_id: argument(target, &mut arguments)?,
                body: argument(target, &mut arguments)?,
            },
            "GetConversationHistory" => Self::RequestConversationHistory {
                with_user_id: argument(target, &mut arguments)?,
                page: argument(target, &mut arguments)?,
            },
            "GetGroupHistory" => Self::RequestGroupHistory {
                group_id: argument(target, &mut arguments)?,
                page: argument(target, &mut arguments)?,
            },
            "GetOnlineUsers" => Self::RequestOnlineUsers,
            "NotifyTyping" => Self::NotifyTyping {
                to_user_id: argument(target, &mut arguments)?,
            },
            "NotifyStopTyping" => Self::NotifyStopTyping {
                to_user_id: argument(target, &mut arguments)?,
            },
            other => {
                return Err(HubError::MalformedPayload(format!(
                    "unknown invocation target {other:?}"
                )));
            }
        };
        Ok(call)
    }
}

fn argument<T: DeserializeOwned>(
    target: &str,
    arguments: &mut impl Iterator<Item = Value>,
) -> Result<T, HubError> {
    let value = arguments
        .next()
        .ok_or_else(|| HubError::MalformedPayload(format!("{target}: missing argument")))?;
    serde_json::from_value(value)
        .map_err(|error| HubError::MalformedPayload(format!("{target}: {error}")))
}

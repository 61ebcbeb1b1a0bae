//! Conversation-related types.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use parley_model::{ModelMessage, ToolCallRequest, ToolCallResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identifier grouping all turns of one logical conversation.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ThreadKey(String);

impl ThreadKey {
    /// Creates a thread key from an arbitrary identifier.
    #[inline]
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Derives the key of a chat channel thread.
    ///
    /// Messages outside of a thread share the key of their channel.
    pub fn for_channel(channel: &str, thread_ts: Option<&str>) -> Self {
        match thread_ts {
            Some(ts) if !ts.is_empty() => Self(format!("{channel}:{ts}")),
            _ => Self(channel.to_owned()),
        }
    }

    /// Returns the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadKey {
    #[inline]
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ThreadKey {
    #[inline]
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The originating role of a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human on the chat surface.
    User,
    /// The model, either answering or requesting tools.
    Assistant,
    /// A tool reporting its result.
    Tool,
}

/// A model-requested call to a named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Correlation identifier assigned by the model.
    pub id: String,
    /// Name of the requested tool.
    pub tool_name: String,
    /// Arguments as sent by the model, not validated yet.
    pub raw_arguments: Value,
    /// The argument text, kept only when the model sent invalid JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unparsed_arguments: Option<String>,
}

impl From<ToolCallRequest> for InvocationRequest {
    #[inline]
    fn from(value: ToolCallRequest) -> Self {
        Self {
            id: value.id,
            tool_name: value.name,
            raw_arguments: value.arguments,
            unparsed_arguments: value.unparsed_arguments,
        }
    }
}

/// Outcome status of an invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// The tool produced a result.
    Success,
    /// The invocation was rejected or the tool failed.
    Error,
}

/// The result of an invocation, correlated to its request by `id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Identifier of the request this result answers.
    pub id: String,
    /// Whether the tool succeeded.
    pub status: InvocationStatus,
    /// Text handed back to the model.
    pub content: String,
}

impl InvocationResult {
    /// Creates a successful result.
    #[inline]
    pub fn success<I: Into<String>, C: Into<String>>(id: I, content: C) -> Self {
        Self {
            id: id.into(),
            status: InvocationStatus::Success,
            content: content.into(),
        }
    }

    /// Creates an error result.
    #[inline]
    pub fn error<I: Into<String>, C: Into<String>>(id: I, content: C) -> Self {
        Self {
            id: id.into(),
            status: InvocationStatus::Error,
            content: content.into(),
        }
    }

    /// Returns `true` if the invocation failed.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.status == InvocationStatus::Error
    }
}

/// The payload of a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPayload {
    /// A message from the user.
    UserMessage {
        /// The message text.
        text: String,
        /// Identifier assigned by the chat surface, used to drop
        /// redelivered messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// A final answer from the model.
    AssistantMessage {
        /// The answer text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolRequest(InvocationRequest),
    /// The result of a requested tool invocation.
    ToolResult(InvocationResult),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum DedupKey {
    Message(String),
    Request(String),
    Result(String),
}

impl TurnPayload {
    /// Creates a user message payload without a message id.
    #[inline]
    pub fn user<S: Into<String>>(text: S) -> Self {
        Self::UserMessage {
            text: text.into(),
            message_id: None,
        }
    }

    /// Creates an assistant message payload.
    #[inline]
    pub fn assistant<S: Into<String>>(text: S) -> Self {
        Self::AssistantMessage { text: text.into() }
    }

    /// Returns the originating role.
    pub fn role(&self) -> Role {
        match self {
            TurnPayload::UserMessage { .. } => Role::User,
            TurnPayload::AssistantMessage { .. }
            | TurnPayload::ToolRequest(_) => Role::Assistant,
            TurnPayload::ToolResult(_) => Role::Tool,
        }
    }

    /// Returns `true` for tool requests and tool results.
    #[inline]
    pub fn is_tool_turn(&self) -> bool {
        matches!(
            self,
            TurnPayload::ToolRequest(_) | TurnPayload::ToolResult(_)
        )
    }

    pub(crate) fn dedup_key(&self) -> Option<DedupKey> {
        match self {
            TurnPayload::UserMessage { message_id, .. } => {
                message_id.clone().map(DedupKey::Message)
            }
            TurnPayload::AssistantMessage { .. } => None,
            TurnPayload::ToolRequest(req) => {
                Some(DedupKey::Request(req.id.clone()))
            }
            TurnPayload::ToolResult(res) => {
                Some(DedupKey::Result(res.id.clone()))
            }
        }
    }
}

/// One atomic unit of conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub(crate) position: u64,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) payload: TurnPayload,
}

impl Turn {
    /// Returns the zero-based position of this turn in its conversation.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns when this turn was appended.
    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the originating role.
    #[inline]
    pub fn role(&self) -> Role {
        self.payload.role()
    }

    /// Returns the payload.
    #[inline]
    pub fn payload(&self) -> &TurnPayload {
        &self.payload
    }

    /// Returns the text of user and assistant messages.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            TurnPayload::UserMessage { text, .. }
            | TurnPayload::AssistantMessage { text } => Some(text),
            _ => None,
        }
    }

    pub(crate) fn to_model_message(&self) -> ModelMessage {
        match &self.payload {
            TurnPayload::UserMessage { text, .. } => {
                ModelMessage::User(text.clone())
            }
            TurnPayload::AssistantMessage { text } => {
                ModelMessage::Assistant(text.clone())
            }
            TurnPayload::ToolRequest(req) => {
                ModelMessage::ToolCall(ToolCallRequest {
                    id: req.id.clone(),
                    name: req.tool_name.clone(),
                    arguments: req.raw_arguments.clone(),
                    unparsed_arguments: req.unparsed_arguments.clone(),
                })
            }
            TurnPayload::ToolResult(res) => ModelMessage::Tool(ToolCallResult {
                id: res.id.clone(),
                content: res.content.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_thread_key_for_channel() {
        assert_eq!(
            ThreadKey::for_channel("C123", Some("1700000000.000100")).as_str(),
            "C123:1700000000.000100"
        );
        assert_eq!(ThreadKey::for_channel("C123", None).as_str(), "C123");
        assert_eq!(ThreadKey::for_channel("C123", Some("")).as_str(), "C123");
    }

    #[test]
    fn test_roles_and_dedup_keys() {
        let req = TurnPayload::ToolRequest(InvocationRequest {
            id: "1".to_owned(),
            tool_name: "get_weather".to_owned(),
            raw_arguments: json!({ "location": "Pittsburgh" }),
            unparsed_arguments: None,
        });
        let res = TurnPayload::ToolResult(InvocationResult::success("1", "ok"));
        assert_eq!(req.role(), Role::Assistant);
        assert_eq!(res.role(), Role::Tool);
        // A request and its result share the id but not the dedup key.
        assert_ne!(req.dedup_key(), res.dedup_key());

        assert_eq!(TurnPayload::user("hi").dedup_key(), None);
        assert_eq!(TurnPayload::assistant("hi").dedup_key(), None);
    }

    #[test]
    fn test_payload_serde() {
        let payload = TurnPayload::ToolResult(InvocationResult::error(
            "call_1",
            "Unknown tool: foo",
        ));
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "tool_result",
                "id": "call_1",
                "status": "error",
                "content": "Unknown tool: foo"
            })
        );
        let back: TurnPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}

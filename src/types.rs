use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of completion a client asked for. Drives muxing
/// (`request_type_match`) and pipeline selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Chat,
    Fim,
    Completion,
    Embeddings,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Chat => "chat",
            RequestKind::Fim => "fim",
            RequestKind::Completion => "completion",
            RequestKind::Embeddings => "embeddings",
        }
    }
}

/// One part of a message. Providers with multi-part content (Anthropic,
/// OpenAI vision) map each block to a part; plain-string content becomes a
/// single `Text` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    ToolUse { value: Value },
    ToolResult { value: Value },
    ImageRef { value: Value },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text { text: s.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub parts: Vec<Part>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        ChatMessage {
            role: role.into(),
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text parts. Non-text parts are skipped.
    pub fn flat_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Provider-independent request shape. `raw` keeps the original provider
/// body so an unmutated round-trip to the same provider stays
/// byte-equivalent; normalize-out starts from `raw` and only rewrites the
/// fields the pipeline touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub kind: RequestKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    pub raw: Value,
}

impl GatewayRequest {
    /// The last user message and its index, scanning backwards.
    pub fn last_user_message(&self) -> Option<(String, usize)> {
        for (i, msg) in self.messages.iter().enumerate().rev() {
            if msg.role == "user" {
                return Some((msg.flat_text(), i));
            }
        }
        None
    }

    /// The trailing run of user messages, newest first, joined with
    /// newlines. Stops at the first non-user message.
    pub fn latest_user_block(&self) -> String {
        let mut out = String::new();
        for msg in self.messages.iter().rev() {
            if msg.role != "user" {
                break;
            }
            out.push('\n');
            out.push_str(&msg.flat_text());
        }
        out
    }

}

/// What a stream chunk carries. `Control` is a provider framing event
/// (Anthropic `message_start`, usage-only trailers, ...) that passes
/// through every step untouched and is re-encoded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    Text { content: String },
    ToolCall { value: Value },
    Finish { reason: String },
    Error { message: String },
    Control { event: String },
}

/// One unit of a streamed response, totally ordered per connection by
/// `seq`. `provider_meta` carries the original provider chunk so
/// normalize-out can reproduce it byte-for-byte when untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub seq: u64,
    pub delta: Delta,
    pub provider_meta: Value,
}

impl StreamChunk {
    pub fn text(seq: u64, content: impl Into<String>) -> Self {
        StreamChunk {
            seq,
            delta: Delta::Text {
                content: content.into(),
            },
            provider_meta: Value::Null,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self.delta, Delta::Text { .. })
    }
}

/// A synthesized, locally produced reply (policy short-circuit or error
/// notice). The gateway streams or folds it according to `stream` on the
/// original request.
#[derive(Debug, Clone)]
pub struct LocalReply {
    pub content: String,
    pub step_name: String,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_scans_backwards() {
        let req = GatewayRequest {
            kind: RequestKind::Chat,
            system: None,
            messages: vec![
                ChatMessage::new("user", "first"),
                ChatMessage::new("assistant", "reply"),
                ChatMessage::new("user", "second"),
            ],
            model: "m".into(),
            stream: false,
            temperature: None,
            max_tokens: None,
            stop: None,
            raw: Value::Null,
        };
        let (text, idx) = req.last_user_message().unwrap();
        assert_eq!(text, "second");
        assert_eq!(idx, 2);
    }

    #[test]
    fn latest_user_block_stops_at_assistant() {
        let req = GatewayRequest {
            kind: RequestKind::Chat,
            system: None,
            messages: vec![
                ChatMessage::new("user", "old"),
                ChatMessage::new("assistant", "a"),
                ChatMessage::new("user", "u1"),
                ChatMessage::new("user", "u2"),
            ],
            model: "m".into(),
            stream: false,
            temperature: None,
            max_tokens: None,
            stop: None,
            raw: Value::Null,
        };
        let block = req.latest_user_block();
        assert!(block.contains("u1"));
        assert!(block.contains("u2"));
        assert!(!block.contains("old"));
    }
}

//! Ollama native dialect: `/api/chat` and `/api/generate`, newline-delimited
//! JSON streaming.

use serde_json::{json, Map, Value};

use crate::errors::GatewayError;
use crate::providers::openai::{content_parts, encode_message};
use crate::types::{ChatMessage, Delta, GatewayRequest, RequestKind, StreamChunk};

pub fn normalize_in(path: &str, body: &Value) -> Result<GatewayRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    // Ollama streams unless told otherwise.
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(true);

    let (kind, system, messages) = if path.ends_with("/api/generate") {
        let prompt = body
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        (
            RequestKind::Completion,
            body.get("system")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            vec![ChatMessage::new("user", prompt)],
        )
    } else if path.ends_with("/api/embed") || path.ends_with("/api/embeddings") {
        let input = match body.get("input").or_else(|| body.get("prompt")) {
            Some(Value::String(s)) => vec![ChatMessage::new("user", s.clone())],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| ChatMessage::new("user", s))
                .collect(),
            _ => Vec::new(),
        };
        (RequestKind::Embeddings, None, input)
    } else {
        let raw_messages = body
            .get("messages")
            .and_then(|v| v.as_array())
            .ok_or_else(|| GatewayError::Internal("messages is not an array".into()))?;
        let mut system = None;
        let mut messages = Vec::with_capacity(raw_messages.len());
        for (i, raw) in raw_messages.iter().enumerate() {
            let role = raw
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("user")
                .to_string();
            let parts = content_parts(raw.get("content"));
            if i == 0 && role == "system" && system.is_none() {
                system = Some(
                    parts
                        .iter()
                        .filter_map(|p| p.as_text())
                        .collect::<Vec<_>>()
                        .join(""),
                );
                continue;
            }
            messages.push(ChatMessage { role, parts });
        }
        (RequestKind::Chat, system, messages)
    };

    let options = body.get("options");
    Ok(GatewayRequest {
        kind,
        system,
        messages,
        model,
        stream,
        temperature: options.and_then(|o| o.get("temperature")).and_then(|v| v.as_f64()),
        max_tokens: options.and_then(|o| o.get("num_predict")).and_then(|v| v.as_u64()),
        stop: options.and_then(|o| o.get("stop")).and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        }),
        raw: body.clone(),
    })
}

pub fn denormalize(request: &GatewayRequest) -> Value {
    let mut body = match &request.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    body.insert("model".into(), Value::String(request.model.clone()));

    if body.contains_key("prompt") {
        let prompt = request
            .messages
            .first()
            .map(|m| m.flat_text())
            .unwrap_or_default();
        body.insert("prompt".into(), Value::String(prompt));
        if let Some(system) = &request.system {
            body.insert("system".into(), Value::String(system.clone()));
        }
    } else if body.contains_key("messages") {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for msg in &request.messages {
            messages.push(encode_message(msg));
        }
        body.insert("messages".into(), Value::Array(messages));
    }
    Value::Object(body)
}

/// One NDJSON line to chunks.
pub fn decode_payload(payload: &str) -> Vec<StreamChunk> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    let mut chunks = Vec::new();

    let text = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| value.get("response").and_then(|r| r.as_str()));
    if let Some(content) = text {
        if !content.is_empty() {
            chunks.push(StreamChunk {
                seq: 0,
                delta: Delta::Text {
                    content: content.to_string(),
                },
                provider_meta: value.clone(),
            });
        }
    }
    if value.get("error").is_some() {
        chunks.push(StreamChunk {
            seq: 0,
            delta: Delta::Error {
                message: value["error"].to_string(),
            },
            provider_meta: value.clone(),
        });
    } else if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        let reason = value
            .get("done_reason")
            .and_then(|r| r.as_str())
            .unwrap_or("stop")
            .to_string();
        chunks.push(StreamChunk {
            seq: 0,
            delta: Delta::Finish { reason },
            provider_meta: value,
        });
    }
    chunks
}

pub fn encode_chunk(chunk: &StreamChunk) -> Vec<u8> {
    let value = match (&chunk.delta, &chunk.provider_meta) {
        (Delta::Text { content }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            patch_content(&mut meta, content);
            // The final done-marker is emitted by its own Finish chunk.
            if let Some(done) = meta.get_mut("done") {
                *done = Value::Bool(false);
            }
            meta
        }
        (Delta::Text { content }, _) => json!({
            "message": {"role": "assistant", "content": content},
            "done": false,
        }),
        (Delta::Finish { .. }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            // Text already went out on its own line.
            patch_content(&mut meta, "");
            meta
        }
        (Delta::Finish { reason }, _) => json!({
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": reason,
        }),
        (Delta::Control { .. }, Value::Object(_)) => chunk.provider_meta.clone(),
        (Delta::Error { message }, _) => json!({"error": message}),
        _ => return Vec::new(),
    };
    let mut bytes = value.to_string().into_bytes();
    bytes.push(b'\n');
    bytes
}

fn patch_content(meta: &mut Value, content: &str) {
    if let Some(message_content) = meta.get_mut("message").and_then(|m| m.get_mut("content")) {
        *message_content = Value::String(content.to_string());
    } else if let Some(response) = meta.get_mut("response") {
        *response = Value::String(content.to_string());
    }
}

pub fn full_response(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "message": {"role": "assistant", "content": content},
        "done": true,
        "done_reason": "stop",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_normalizes() {
        let body = json!({
            "model": "qwen2.5-coder",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let req = normalize_in("/api/chat", &body).unwrap();
        assert_eq!(req.kind, RequestKind::Chat);
        assert!(req.stream, "ollama defaults to streaming");
        assert_eq!(req.model, "qwen2.5-coder");
    }

    #[test]
    fn generate_is_completion_with_prompt() {
        let body = json!({"model": "m", "prompt": "fn main", "system": "you complete code"});
        let req = normalize_in("/api/generate", &body).unwrap();
        assert_eq!(req.kind, RequestKind::Completion);
        assert_eq!(req.system.as_deref(), Some("you complete code"));
        let out = denormalize(&req);
        assert_eq!(out["prompt"], "fn main");
    }

    #[test]
    fn options_are_read() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0.5, "num_predict": 64}
        });
        let req = normalize_in("/api/chat", &body).unwrap();
        assert_eq!(req.temperature, Some(0.5));
        assert_eq!(req.max_tokens, Some(64));
    }

    #[test]
    fn stream_line_decodes_text_then_done() {
        let chunks = decode_payload(r#"{"message":{"content":"hel"},"done":false}"#);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, Delta::Text { content: "hel".into() });

        let done = decode_payload(r#"{"message":{"content":""},"done":true,"done_reason":"stop"}"#);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].delta, Delta::Finish { reason: "stop".into() });
    }

    #[test]
    fn encode_is_one_json_line() {
        let chunk = StreamChunk::text(0, "hi");
        let bytes = encode_chunk(&chunk);
        assert!(bytes.ends_with(b"\n"));
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["message"]["content"], "hi");
        assert_eq!(value["done"], false);
    }

    #[test]
    fn generate_response_patched() {
        let mut chunk = decode_payload(r#"{"response":"REDACTED_x","done":false}"#).remove(0);
        chunk.delta = Delta::Text { content: "plain".into() };
        let bytes = encode_chunk(&chunk);
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["response"], "plain");
    }
}

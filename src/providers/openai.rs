//! OpenAI-compatible dialect: `openai` itself plus `vllm`, `openrouter`,
//! `lm_studio` and `copilot`, which all speak this shape.

use serde_json::{json, Map, Value};

use crate::errors::GatewayError;
use crate::types::{ChatMessage, Delta, GatewayRequest, Part, RequestKind, StreamChunk};

pub fn normalize_in(path: &str, body: &Value) -> Result<GatewayRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let (kind, system, messages) = if path.ends_with("/embeddings") {
        (RequestKind::Embeddings, None, embedding_messages(body))
    } else if body.get("messages").is_some() {
        let (system, messages) = chat_messages(body)?;
        (RequestKind::Chat, system, messages)
    } else {
        let prompt = body
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        (
            RequestKind::Completion,
            None,
            vec![ChatMessage::new("user", prompt)],
        )
    };

    Ok(GatewayRequest {
        kind,
        system,
        messages,
        model,
        stream,
        temperature: body.get("temperature").and_then(|v| v.as_f64()),
        max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()),
        stop: stop_list(body.get("stop")),
        raw: body.clone(),
    })
}

/// A leading system message is lifted into the common `system` field and
/// restored at the front on the way out.
fn chat_messages(body: &Value) -> Result<(Option<String>, Vec<ChatMessage>), GatewayError> {
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
    Ok((system, messages))
}

pub(crate) fn content_parts(content: Option<&Value>) -> Vec<Part> {
    match content {
        Some(Value::String(s)) => vec![Part::text(s.clone())],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => Part::text(
                    block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default(),
                ),
                Some("tool_use") => Part::ToolUse {
                    value: block.clone(),
                },
                Some("tool_result") => Part::ToolResult {
                    value: block.clone(),
                },
                Some("image_url") | Some("image") => Part::ImageRef {
                    value: block.clone(),
                },
                _ => Part::text(block.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn embedding_messages(body: &Value) -> Vec<ChatMessage> {
    match body.get("input") {
        Some(Value::String(s)) => vec![ChatMessage::new("user", s.clone())],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| ChatMessage::new("user", s))
            .collect(),
        _ => Vec::new(),
    }
}

fn stop_list(stop: Option<&Value>) -> Option<Vec<String>> {
    match stop {
        Some(Value::String(s)) => Some(vec![s.clone()]),
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        _ => None,
    }
}

pub fn denormalize(request: &GatewayRequest) -> Value {
    let mut body = match &request.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    body.insert("model".into(), Value::String(request.model.clone()));

    match request.kind {
        RequestKind::Chat => {
            let mut messages = Vec::new();
            if let Some(system) = &request.system {
                messages.push(json!({"role": "system", "content": system}));
            }
            for msg in &request.messages {
                messages.push(encode_message(msg));
            }
            body.insert("messages".into(), Value::Array(messages));
        }
        RequestKind::Completion | RequestKind::Fim => {
            if body.contains_key("prompt") {
                let prompt = request
                    .messages
                    .first()
                    .map(|m| m.flat_text())
                    .unwrap_or_default();
                body.insert("prompt".into(), Value::String(prompt));
            } else if body.contains_key("messages") {
                // FIM carried over chat messages.
                let messages = request.messages.iter().map(encode_message).collect();
                body.insert("messages".into(), Value::Array(messages));
            }
        }
        RequestKind::Embeddings => {
            let was_string = matches!(request.raw.get("input"), Some(Value::String(_)));
            let texts: Vec<String> = request.messages.iter().map(|m| m.flat_text()).collect();
            let input = if was_string && texts.len() == 1 {
                Value::String(texts.into_iter().next().unwrap_or_default())
            } else {
                Value::Array(texts.into_iter().map(Value::String).collect())
            };
            body.insert("input".into(), input);
        }
    }
    Value::Object(body)
}

pub(crate) fn encode_message(msg: &ChatMessage) -> Value {
    // A single text part collapses back to plain-string content.
    if msg.parts.len() == 1 {
        if let Some(text) = msg.parts[0].as_text() {
            return json!({"role": msg.role, "content": text});
        }
    }
    let blocks: Vec<Value> = msg
        .parts
        .iter()
        .map(|part| match part {
            Part::Text { text } => json!({"type": "text", "text": text}),
            Part::ToolUse { value } | Part::ToolResult { value } | Part::ImageRef { value } => {
                value.clone()
            }
        })
        .collect();
    json!({"role": msg.role, "content": blocks})
}

/// One SSE `data:` payload to chunks.
pub fn decode_payload(payload: &str) -> Vec<StreamChunk> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    let Some(choice) = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        if value.get("error").is_some() {
            return vec![StreamChunk {
                seq: 0,
                delta: Delta::Error {
                    message: value["error"].to_string(),
                },
                provider_meta: value,
            }];
        }
        // Usage-only trailers and other choiceless payloads pass through.
        return vec![StreamChunk {
            seq: 0,
            delta: Delta::Control {
                event: "data".to_string(),
            },
            provider_meta: value,
        }];
    };

    let mut chunks = Vec::new();
    let text = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| choice.get("text").and_then(|t| t.as_str()));
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
    if let Some(tool_calls) = choice.get("delta").and_then(|d| d.get("tool_calls")) {
        chunks.push(StreamChunk {
            seq: 0,
            delta: Delta::ToolCall {
                value: tool_calls.clone(),
            },
            provider_meta: value.clone(),
        });
    }
    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        chunks.push(StreamChunk {
            seq: 0,
            delta: Delta::Finish {
                reason: reason.to_string(),
            },
            provider_meta: value,
        });
    }
    chunks
}

/// Chunk back to wire bytes. When the original provider payload is
/// retained, only the content field is rewritten, so provider extras
/// survive; synthetic chunks get a minimal chat-completion shape.
pub fn encode_chunk(chunk: &StreamChunk) -> Vec<u8> {
    let value = match (&chunk.delta, &chunk.provider_meta) {
        (Delta::Text { content }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            patch_content(&mut meta, content);
            meta
        }
        (Delta::Text { content }, _) => json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": content},
                         "finish_reason": null}],
        }),
        (Delta::Finish { .. }, Value::Object(_)) => {
            // Text that rode along in this payload already went out on its
            // own (rewritten) chunk; do not repeat the stale copy.
            let mut meta = chunk.provider_meta.clone();
            patch_content(&mut meta, "");
            meta
        }
        (Delta::Finish { reason }, _) => json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {}, "finish_reason": reason}],
        }),
        (Delta::ToolCall { .. }, Value::Object(_)) => chunk.provider_meta.clone(),
        (Delta::ToolCall { value }, _) => json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"tool_calls": value}, "finish_reason": null}],
        }),
        (Delta::Control { .. }, Value::Object(_)) => chunk.provider_meta.clone(),
        (Delta::Control { .. }, _) => return Vec::new(),
        (Delta::Error { message }, _) => json!({"error": {"message": message}}),
    };
    format!("data: {value}\n\n").into_bytes()
}

fn patch_content(meta: &mut Value, content: &str) {
    if let Some(choice) = meta
        .get_mut("choices")
        .and_then(|c| c.as_array_mut())
        .and_then(|c| c.first_mut())
    {
        if let Some(delta_content) = choice.get_mut("delta").and_then(|d| d.get_mut("content")) {
            *delta_content = Value::String(content.to_string());
            return;
        }
        if let Some(text) = choice.get_mut("text") {
            *text = Value::String(content.to_string());
        }
    }
}

pub fn full_response(model: &str, content: &str) -> Value {
    json!({
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_normalizes_and_lifts_system() {
        let body = json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hello"}
            ]
        });
        let req = normalize_in("/v1/chat/completions", &body).unwrap();
        assert_eq!(req.kind, RequestKind::Chat);
        assert_eq!(req.system.as_deref(), Some("be helpful"));
        assert_eq!(req.messages.len(), 1);
        assert!(req.stream);
    }

    #[test]
    fn round_trip_is_stable() {
        let body = json!({
            "model": "gpt-4o-mini",
            "temperature": 0.2,
            "custom_vendor_field": {"x": 1},
            "messages": [
                {"role": "system", "content": "be helpful"},
                {"role": "user", "content": "hello"}
            ]
        });
        let req = normalize_in("/v1/chat/completions", &body).unwrap();
        let out = denormalize(&req);
        assert_eq!(out, body);
    }

    #[test]
    fn multipart_content_becomes_parts() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look at this"},
                {"type": "image_url", "image_url": {"url": "http://x/y.png"}}
            ]}]
        });
        let req = normalize_in("/v1/chat/completions", &body).unwrap();
        assert_eq!(req.messages[0].parts.len(), 2);
        assert!(matches!(req.messages[0].parts[1], Part::ImageRef { .. }));
    }

    #[test]
    fn completion_prompt_round_trips() {
        let body = json!({"model": "m", "prompt": "complete me", "stream": false});
        let req = normalize_in("/v1/completions", &body).unwrap();
        assert_eq!(req.messages[0].flat_text(), "complete me");
        let out = denormalize(&req);
        assert_eq!(out["prompt"], "complete me");
    }

    #[test]
    fn stream_payload_decodes_text_and_finish() {
        let payload = r#"{"choices":[{"index":0,"delta":{"content":"hi"},"finish_reason":null}]}"#;
        let chunks = decode_payload(payload);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, Delta::Text { content: "hi".into() });

        let fin = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let chunks = decode_payload(fin);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0].delta, Delta::Finish { .. }));
    }

    #[test]
    fn encode_patches_retained_payload() {
        let payload = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"REDACTED"},"finish_reason":null}]}"#;
        let mut chunk = decode_payload(payload).remove(0);
        chunk.delta = Delta::Text {
            content: "restored".into(),
        };
        let wire = String::from_utf8(encode_chunk(&chunk)).unwrap();
        assert!(wire.starts_with("data: "));
        assert!(wire.contains("\"restored\""));
        assert!(wire.contains("\"id\":\"c1\""));
    }

    #[test]
    fn synthetic_chunk_has_chat_shape() {
        let chunk = StreamChunk::text(0, "notice");
        let wire = String::from_utf8(encode_chunk(&chunk)).unwrap();
        let value: Value = serde_json::from_str(wire.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"], "notice");
    }
}

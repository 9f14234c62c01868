//! Anthropic Messages API dialect.
//!
//! The stream is a sequence of named SSE events; only `content_block_delta`
//! carries text. Framing events (`message_start`, `content_block_start`,
//! `message_stop`, `ping`, ...) become `Control` chunks and are re-emitted
//! verbatim so the client-side protocol state machine stays intact.

use serde_json::{json, Map, Value};

use crate::errors::GatewayError;
use crate::providers::openai::{content_parts, encode_message};
use crate::types::{ChatMessage, Delta, GatewayRequest, RequestKind, StreamChunk};

pub fn normalize_in(_path: &str, body: &Value) -> Result<GatewayRequest, GatewayError> {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let system = match body.get("system") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(blocks)) => Some(
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    };

    let raw_messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| GatewayError::Internal("messages is not an array".into()))?;
    let messages = raw_messages
        .iter()
        .map(|raw| ChatMessage {
            role: raw
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("user")
                .to_string(),
            parts: content_parts(raw.get("content")),
        })
        .collect();

    Ok(GatewayRequest {
        kind: RequestKind::Chat,
        system,
        messages,
        model,
        stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        temperature: body.get("temperature").and_then(|v| v.as_f64()),
        max_tokens: body.get("max_tokens").and_then(|v| v.as_u64()),
        stop: body.get("stop_sequences").and_then(|v| v.as_array()).map(|a| {
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
    match &request.system {
        Some(system) => {
            body.insert("system".into(), Value::String(system.clone()));
        }
        None => {
            body.remove("system");
        }
    }
    let messages: Vec<Value> = request.messages.iter().map(encode_message).collect();
    body.insert("messages".into(), Value::Array(messages));
    Value::Object(body)
}

pub fn decode_payload(payload: &str) -> Vec<StreamChunk> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    let event = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    let delta = match event.as_str() {
        "content_block_delta" => {
            match value.get("delta").and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                Some(text) => Delta::Text {
                    content: text.to_string(),
                },
                // input_json_delta and friends pass through.
                None => Delta::Control { event },
            }
        }
        "message_delta" => {
            let reason = value
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|r| r.as_str())
                .unwrap_or("end_turn")
                .to_string();
            Delta::Finish { reason }
        }
        "error" => Delta::Error {
            message: value
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into()),
        },
        _ => Delta::Control { event },
    };

    vec![StreamChunk {
        seq: 0,
        delta,
        provider_meta: value,
    }]
}

pub fn encode_chunk(chunk: &StreamChunk) -> Vec<u8> {
    let value = match (&chunk.delta, &chunk.provider_meta) {
        (Delta::Text { content }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            if let Some(text) = meta.get_mut("delta").and_then(|d| d.get_mut("text")) {
                *text = Value::String(content.to_string());
            }
            meta
        }
        (Delta::Text { content }, _) => json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": content},
        }),
        (Delta::Finish { .. }, Value::Object(_))
        | (Delta::Control { .. }, Value::Object(_))
        | (Delta::ToolCall { .. }, Value::Object(_)) => chunk.provider_meta.clone(),
        (Delta::Finish { reason }, _) => json!({
            "type": "message_delta",
            "delta": {"stop_reason": reason, "stop_sequence": null},
        }),
        (Delta::Error { message }, _) => json!({
            "type": "error",
            "error": {"type": "api_error", "message": message},
        }),
        _ => return Vec::new(),
    };
    let event = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("content_block_delta");
    format!("event: {event}\ndata: {value}\n\n").into_bytes()
}

pub fn full_response(model: &str, content: &str) -> Value {
    json!({
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": content}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
    })
}

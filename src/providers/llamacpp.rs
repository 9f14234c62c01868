//! llama.cpp server dialect: native `/completion` (SSE with a bare
//! `content` field) plus the OpenAI-compatible `/v1/*` routes, which are
//! delegated to the openai codec.

use serde_json::{json, Map, Value};

use crate::errors::GatewayError;
use crate::providers::openai;
use crate::types::{ChatMessage, Delta, GatewayRequest, RequestKind, StreamChunk};

pub fn normalize_in(path: &str, body: &Value) -> Result<GatewayRequest, GatewayError> {
    if path.contains("/v1/") {
        return openai::normalize_in(path, body);
    }
    let prompt = body
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Ok(GatewayRequest {
        kind: RequestKind::Completion,
        system: None,
        messages: vec![ChatMessage::new("user", prompt)],
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        stream: body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        temperature: body.get("temperature").and_then(|v| v.as_f64()),
        max_tokens: body.get("n_predict").and_then(|v| v.as_u64()),
        stop: body.get("stop").and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        }),
        raw: body.clone(),
    })
}

pub fn denormalize(request: &GatewayRequest) -> Value {
    if request.raw.get("messages").is_some() {
        return openai::denormalize(request);
    }
    let mut body = match &request.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let prompt = request
        .messages
        .first()
        .map(|m| m.flat_text())
        .unwrap_or_default();
    body.insert("prompt".into(), Value::String(prompt));
    if !request.model.is_empty() {
        body.insert("model".into(), Value::String(request.model.clone()));
    }
    Value::Object(body)
}

pub fn decode_payload(payload: &str) -> Vec<StreamChunk> {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };
    // OpenAI-compatible route: chunks carry `choices`.
    if value.get("choices").is_some() {
        return openai::decode_payload(payload);
    }

    let mut chunks = Vec::new();
    if let Some(content) = value.get("content").and_then(|c| c.as_str()) {
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
    if value.get("stop").and_then(|s| s.as_bool()).unwrap_or(false) {
        chunks.push(StreamChunk {
            seq: 0,
            delta: Delta::Finish {
                reason: "stop".to_string(),
            },
            provider_meta: value,
        });
    }
    chunks
}

pub fn encode_chunk(chunk: &StreamChunk) -> Vec<u8> {
    if chunk.provider_meta.get("choices").is_some() {
        return openai::encode_chunk(chunk);
    }
    let value = match (&chunk.delta, &chunk.provider_meta) {
        (Delta::Text { content }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            if let Some(c) = meta.get_mut("content") {
                *c = Value::String(content.to_string());
            }
            if let Some(stop) = meta.get_mut("stop") {
                *stop = Value::Bool(false);
            }
            meta
        }
        (Delta::Text { content }, _) => json!({"content": content, "stop": false}),
        (Delta::Finish { .. }, Value::Object(_)) => {
            let mut meta = chunk.provider_meta.clone();
            if let Some(c) = meta.get_mut("content") {
                *c = Value::String(String::new());
            }
            meta
        }
        (Delta::Finish { .. }, _) => json!({"content": "", "stop": true}),
        (Delta::Control { .. }, Value::Object(_)) => chunk.provider_meta.clone(),
        (Delta::Error { message }, _) => json!({"error": {"message": message}}),
        _ => return Vec::new(),
    };
    format!("data: {value}\n\n").into_bytes()
}

pub fn full_response(model: &str, content: &str) -> Value {
    json!({
        "content": content,
        "model": model,
        "stop": true,
        "stopped_eos": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn native_completion_normalizes() {
        let body = json!({"prompt": "<|fim_prefix|>fn x(<|fim_suffix|>)<|fim_middle|>", "n_predict": 64});
        let req = normalize_in("/completion", &body).unwrap();
        assert_eq!(req.kind, RequestKind::Completion);
        assert_eq!(req.max_tokens, Some(64));
    }

    #[test]
    fn native_round_trip_preserves_params() {
        let body = json!({"prompt": "p", "n_predict": 64, "cache_prompt": true});
        let req = normalize_in("/completion", &body).unwrap();
        let out = denormalize(&req);
        assert_eq!(out["cache_prompt"], true);
        assert_eq!(out["prompt"], "p");
    }

    #[test]
    fn openai_route_delegates() {
        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let req = normalize_in("/v1/chat/completions", &body).unwrap();
        assert_eq!(req.kind, RequestKind::Chat);
    }

    #[test]
    fn native_stream_decodes() {
        let chunks = decode_payload(r#"{"content":"tok","stop":false}"#);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].delta, Delta::Text { content: "tok".into() });

        let end = decode_payload(r#"{"content":"","stop":true,"tokens_predicted":10}"#);
        assert_eq!(end.len(), 1);
        assert!(matches!(end[0].delta, Delta::Finish { .. }));
    }

    #[test]
    fn text_rewrite_survives_encode() {
        let mut chunk = decode_payload(r#"{"content":"old","stop":false}"#).remove(0);
        chunk.delta = Delta::Text { content: "new".into() };
        let wire = String::from_utf8(encode_chunk(&chunk)).unwrap();
        assert!(wire.contains("\"new\""));
        assert!(!wire.contains("\"old\""));
    }
}

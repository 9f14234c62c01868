//! Provider normalizers: per-provider adapters between the native wire
//! shapes and the gateway's common request/chunk shape.
//!
//! The set is closed: every supported upstream is one of `ProviderKind`.
//! `vllm`, `openrouter`, `lm_studio` and `copilot` speak the
//! OpenAI-compatible dialect; `ollama` and `llamacpp` have native codecs;
//! `anthropic` has its event-stream codec.

pub mod anthropic;
pub mod llamacpp;
pub mod ollama;
pub mod openai;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::GatewayError;
use crate::types::{GatewayRequest, RequestKind, StreamChunk};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    LlamaCpp,
    Vllm,
    OpenRouter,
    LmStudio,
    Copilot,
}

pub const ALL_PROVIDERS: &[ProviderKind] = &[
    ProviderKind::OpenAi,
    ProviderKind::Anthropic,
    ProviderKind::Ollama,
    ProviderKind::LlamaCpp,
    ProviderKind::Vllm,
    ProviderKind::OpenRouter,
    ProviderKind::LmStudio,
    ProviderKind::Copilot,
];

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::LlamaCpp => "llamacpp",
            ProviderKind::Vllm => "vllm",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::LmStudio => "lm_studio",
            ProviderKind::Copilot => "copilot",
        }
    }

    /// URL prefix on the clear proxy port.
    pub fn prefix(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "/openai",
            ProviderKind::Anthropic => "/anthropic",
            ProviderKind::Ollama => "/ollama",
            ProviderKind::LlamaCpp => "/llamacpp",
            ProviderKind::Vllm => "/vllm",
            ProviderKind::OpenRouter => "/openrouter",
            ProviderKind::LmStudio => "/lm-studio",
            ProviderKind::Copilot => "/copilot",
        }
    }

    /// Resolve a request path to a provider and the remaining path.
    pub fn from_path(path: &str) -> Option<(ProviderKind, String)> {
        for kind in ALL_PROVIDERS {
            let prefix = kind.prefix();
            if let Some(rest) = path.strip_prefix(prefix) {
                if rest.is_empty() {
                    return Some((*kind, "/".to_string()));
                }
                if rest.starts_with('/') {
                    return Some((*kind, rest.to_string()));
                }
            }
        }
        None
    }

    /// The wire dialect this provider speaks.
    fn dialect(&self) -> Dialect {
        match self {
            ProviderKind::Anthropic => Dialect::Anthropic,
            ProviderKind::Ollama => Dialect::Ollama,
            ProviderKind::LlamaCpp => Dialect::LlamaCpp,
            _ => Dialect::OpenAi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenAi,
    Anthropic,
    Ollama,
    LlamaCpp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    ApiKey,
    Bearer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub id: String,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl ProviderEndpoint {
    pub fn named(name: &str, kind: ProviderKind, base_url: &str) -> Self {
        ProviderEndpoint {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: AuthKind::None,
            api_key: None,
        }
    }

    /// Auth headers for the upstream call. Anthropic and Copilot use
    /// `x-api-key`-style headers; everything else is a bearer.
    pub fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let Some(key) = &self.api_key else {
            return Vec::new();
        };
        match self.auth {
            AuthKind::None => Vec::new(),
            AuthKind::ApiKey => vec![("x-api-key", key.clone())],
            AuthKind::Bearer => vec![("authorization", format!("Bearer {key}"))],
        }
    }
}

type EndpointSnapshot = Arc<Vec<ProviderEndpoint>>;

/// Global provider-endpoint list, copy-on-write like the workspace list.
pub struct EndpointRegistry {
    snapshot: RwLock<EndpointSnapshot>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        EndpointRegistry {
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Seed one endpoint per provider from the configured default URLs,
    /// then overlay persisted rows (matched by name).
    pub fn bootstrap(config: &Config, persisted: Vec<ProviderEndpoint>) -> Self {
        let mut endpoints: Vec<ProviderEndpoint> = ALL_PROVIDERS
            .iter()
            .filter_map(|kind| {
                config
                    .provider_url(kind.as_str())
                    .map(|url| ProviderEndpoint::named(kind.as_str(), *kind, url))
            })
            .collect();
        for row in persisted {
            match endpoints.iter_mut().find(|e| e.name == row.name) {
                Some(existing) => *existing = row,
                None => endpoints.push(row),
            }
        }
        EndpointRegistry {
            snapshot: RwLock::new(Arc::new(endpoints)),
        }
    }

    pub fn read(&self) -> EndpointSnapshot {
        self.snapshot.read().unwrap().clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<ProviderEndpoint> {
        self.read().iter().find(|e| e.id == id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<ProviderEndpoint> {
        self.read().iter().find(|e| e.name == name).cloned()
    }

    pub fn upsert(&self, endpoint: ProviderEndpoint) {
        let mut guard = self.snapshot.write().unwrap();
        let mut list = Vec::clone(&guard);
        match list.iter_mut().find(|e| e.id == endpoint.id) {
            Some(existing) => *existing = endpoint,
            None => list.push(endpoint),
        }
        *guard = Arc::new(list);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.snapshot.write().unwrap();
        let mut list = Vec::clone(&guard);
        let before = list.len();
        list.retain(|e| e.id != id);
        let removed = list.len() != before;
        *guard = Arc::new(list);
        removed
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether two providers share a wire dialect. When they do, retained
/// provider payloads can be re-encoded as-is; when they do not, the
/// encoder synthesizes chunks in the client-side dialect.
pub fn wire_compatible(a: ProviderKind, b: ProviderKind) -> bool {
    a.dialect() == b.dialect()
}

/// The canonical upstream path for a muxed request, per provider dialect.
pub fn upstream_path(kind: ProviderKind, request_kind: RequestKind) -> &'static str {
    match kind.dialect() {
        Dialect::OpenAi => match request_kind {
            RequestKind::Chat => "/v1/chat/completions",
            RequestKind::Fim | RequestKind::Completion => "/v1/completions",
            RequestKind::Embeddings => "/v1/embeddings",
        },
        Dialect::Anthropic => "/v1/messages",
        Dialect::Ollama => match request_kind {
            RequestKind::Chat => "/api/chat",
            RequestKind::Fim | RequestKind::Completion => "/api/generate",
            RequestKind::Embeddings => "/api/embed",
        },
        Dialect::LlamaCpp => match request_kind {
            RequestKind::Chat => "/v1/chat/completions",
            RequestKind::Fim | RequestKind::Completion => "/completion",
            RequestKind::Embeddings => "/v1/embeddings",
        },
    }
}

/// Determine whether a request is fill-in-the-middle.
///
/// URL heuristic first (`/completions` that is not `chat/completions`, and
/// ollama's `/api/generate`), then marker heuristics over the prompt body.
/// Agent tools that wrap completions in chat (`cline`, `kodu`,
/// `open interpreter`) are never FIM.
pub fn is_fim_request(path: &str, body: &Value) -> bool {
    let prompt_text = body
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    for tool in ["cline", "kodu", "open interpreter"] {
        if prompt_text.contains(tool) {
            return false;
        }
    }

    if !path.ends_with("chat/completions")
        && (path.ends_with("completions") || path.ends_with("api/generate") || path.ends_with("completion"))
    {
        return true;
    }

    if prompt_text.contains("<|fim_prefix|>") || prompt_text.contains("<fim_prefix>") {
        return true;
    }

    // Copilot-style FIM over chat: the first message carries completion
    // markers.
    if let Some(first) = body
        .get("messages")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
    {
        let content = match first.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .first()
                .and_then(|p| p.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };
        let markers = ["<COMPLETION>", "</COMPLETION>", "<QUERY>", "</QUERY>"];
        if markers.iter().all(|m| content.contains(m)) {
            return true;
        }
    }

    false
}

/// Parse a native provider body into the common shape.
pub fn normalize_in(
    kind: ProviderKind,
    path: &str,
    body: &Value,
) -> Result<GatewayRequest, GatewayError> {
    let mut request = match kind.dialect() {
        Dialect::OpenAi => openai::normalize_in(path, body)?,
        Dialect::Anthropic => anthropic::normalize_in(path, body)?,
        Dialect::Ollama => ollama::normalize_in(path, body)?,
        Dialect::LlamaCpp => llamacpp::normalize_in(path, body)?,
    };
    if request.kind != RequestKind::Embeddings && is_fim_request(path, body) {
        request.kind = RequestKind::Fim;
    }
    Ok(request)
}

/// Produce the native provider body from the common shape, starting from
/// the retained raw body so unknown provider fields survive untouched.
pub fn denormalize(kind: ProviderKind, request: &GatewayRequest) -> Value {
    match kind.dialect() {
        Dialect::OpenAi => openai::denormalize(request),
        Dialect::Anthropic => anthropic::denormalize(request),
        Dialect::Ollama => ollama::denormalize(request),
        Dialect::LlamaCpp => llamacpp::denormalize(request),
    }
}

/// Incremental decoder: upstream bytes in, ordered `StreamChunk`s out.
/// Carries a line buffer across feeds because chunk boundaries land
/// anywhere.
pub struct StreamDecoder {
    kind: ProviderKind,
    buffer: String,
    seq: u64,
}

impl StreamDecoder {
    pub fn new(kind: ProviderKind) -> Self {
        StreamDecoder {
            kind,
            buffer: String::new(),
            seq: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut chunks = Vec::new();
        loop {
            let (consumed, payloads) = match self.kind.dialect() {
                Dialect::Ollama => next_line(&self.buffer),
                _ => next_sse_event(&self.buffer),
            };
            if consumed == 0 {
                break;
            }
            self.buffer.drain(..consumed);
            for payload in payloads {
                let decoded = match self.kind.dialect() {
                    Dialect::OpenAi => openai::decode_payload(&payload),
                    Dialect::Anthropic => anthropic::decode_payload(&payload),
                    Dialect::Ollama => ollama::decode_payload(&payload),
                    Dialect::LlamaCpp => llamacpp::decode_payload(&payload),
                };
                for mut chunk in decoded {
                    chunk.seq = self.seq;
                    self.seq += 1;
                    chunks.push(chunk);
                }
            }
        }
        chunks
    }
}

/// Serialize a chunk back to the provider's wire format.
pub fn encode_chunk(kind: ProviderKind, chunk: &StreamChunk) -> Vec<u8> {
    match kind.dialect() {
        Dialect::OpenAi => openai::encode_chunk(chunk),
        Dialect::Anthropic => anthropic::encode_chunk(chunk),
        Dialect::Ollama => ollama::encode_chunk(chunk),
        Dialect::LlamaCpp => llamacpp::encode_chunk(chunk),
    }
}

/// Trailing bytes that close the stream (`data: [DONE]` where the dialect
/// uses it).
pub fn encode_stream_end(kind: ProviderKind) -> Vec<u8> {
    match kind.dialect() {
        Dialect::OpenAi | Dialect::LlamaCpp => b"data: [DONE]\n\n".to_vec(),
        Dialect::Anthropic | Dialect::Ollama => Vec::new(),
    }
}

/// A complete non-streamed response carrying `content`, in the provider's
/// native response shape.
pub fn encode_full_response(kind: ProviderKind, model: &str, content: &str) -> Value {
    match kind.dialect() {
        Dialect::OpenAi => openai::full_response(model, content),
        Dialect::Anthropic => anthropic::full_response(model, content),
        Dialect::Ollama => ollama::full_response(model, content),
        Dialect::LlamaCpp => llamacpp::full_response(model, content),
    }
}

/// The assistant text inside a complete (non-streamed) provider response.
pub fn extract_full_content(kind: ProviderKind, body: &Value) -> Option<String> {
    match kind.dialect() {
        Dialect::OpenAi => {
            let choice = body.get("choices")?.as_array()?.first()?;
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .or_else(|| choice.get("text").and_then(|t| t.as_str()))
                .map(|s| s.to_string())
        }
        Dialect::Anthropic => body
            .get("content")?
            .as_array()?
            .iter()
            .find_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(|s| s.to_string()),
        Dialect::Ollama => body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .or_else(|| body.get("response").and_then(|r| r.as_str()))
            .map(|s| s.to_string()),
        Dialect::LlamaCpp => body
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .or_else(|| extract_full_content(ProviderKind::OpenAi, body)),
    }
}

/// Rewrite the assistant text inside a complete provider response.
pub fn patch_full_content(kind: ProviderKind, body: &mut Value, content: &str) -> bool {
    match kind.dialect() {
        Dialect::OpenAi => {
            let Some(choice) = body
                .get_mut("choices")
                .and_then(|c| c.as_array_mut())
                .and_then(|c| c.first_mut())
            else {
                return false;
            };
            if let Some(slot) = choice.get_mut("message").and_then(|m| m.get_mut("content")) {
                *slot = Value::String(content.to_string());
                return true;
            }
            if let Some(slot) = choice.get_mut("text") {
                *slot = Value::String(content.to_string());
                return true;
            }
            false
        }
        Dialect::Anthropic => {
            let Some(block) = body
                .get_mut("content")
                .and_then(|c| c.as_array_mut())
                .and_then(|blocks| {
                    blocks
                        .iter_mut()
                        .find(|b| b.get("text").is_some())
                })
            else {
                return false;
            };
            block["text"] = Value::String(content.to_string());
            true
        }
        Dialect::Ollama => {
            if let Some(slot) = body.get_mut("message").and_then(|m| m.get_mut("content")) {
                *slot = Value::String(content.to_string());
                return true;
            }
            if let Some(slot) = body.get_mut("response") {
                *slot = Value::String(content.to_string());
                return true;
            }
            false
        }
        Dialect::LlamaCpp => {
            if body.get("choices").is_some() {
                return patch_full_content(ProviderKind::OpenAi, body, content);
            }
            if let Some(slot) = body.get_mut("content") {
                *slot = Value::String(content.to_string());
                return true;
            }
            false
        }
    }
}

/// One event's `data:` payloads from the front of an SSE buffer.
/// Returns (bytes consumed, payloads); consumed 0 means "wait for more".
fn next_sse_event(buffer: &str) -> (usize, Vec<String>) {
    let Some(end) = buffer.find("\n\n") else {
        return (0, Vec::new());
    };
    let event = &buffer[..end];
    let mut payloads = Vec::new();
    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() && data != "[DONE]" {
                payloads.push(data.to_string());
            }
        }
    }
    (end + 2, payloads)
}

/// One newline-delimited JSON payload from the front of the buffer.
fn next_line(buffer: &str) -> (usize, Vec<String>) {
    let Some(end) = buffer.find('\n') else {
        return (0, Vec::new());
    };
    let line = buffer[..end].trim();
    let payloads = if line.is_empty() {
        Vec::new()
    } else {
        vec![line.to_string()]
    };
    (end + 1, payloads)
}

//! The gateway front: the clear-HTTP proxy port.
//!
//! One hyper task per accepted connection; each request is normalized,
//! driven through the request pipeline, forwarded to the routed upstream,
//! and its response pulled back through the output pipeline. Streaming is
//! relayed chunk-by-chunk over a bounded channel, so client backpressure
//! reaches the upstream read and a client disconnect cancels the upstream
//! task on its next send.

pub mod upstream;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::errors::GatewayError;
use crate::pii::PiiRecognizer;
use crate::pipeline::mux_resolve::MuxResolve;
use crate::pipeline::output::{
    OutputContext, OutputPipeline, PersistOutputsStep, RedactionNoticeStep, UnredactStep,
};
use crate::pipeline::packages::MaliciousPackageCheck;
use crate::pipeline::pii_step::PiiRedact;
use crate::pipeline::secrets::SecretRedact;
use crate::pipeline::system_prompt::SystemPromptInject;
use crate::pipeline::{
    CodeSnippetExtract, PipelineContext, RequestPipeline, Verdict,
};
use crate::providers::{self, EndpointRegistry, ProviderKind};
use crate::session::SessionRegistry;
use crate::stats::Stats;
use crate::storage::{Db, PackageIndex, PromptRecord};
use crate::types::{Delta, GatewayRequest, LocalReply, StreamChunk};
use crate::workspaces::{WorkspaceRegistry, DEFAULT_WORKSPACE};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Everything a request handler needs, shared across connections.
pub struct GatewayState {
    pub client: reqwest::Client,
    pub workspaces: Arc<WorkspaceRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub db: Option<Arc<Db>>,
    pub package_index: Arc<PackageIndex>,
    pub recognizer: Arc<dyn PiiRecognizer>,
    pub stats: Arc<Stats>,
}

impl GatewayState {
    /// The canonical request-step chain (spec order). A fresh pipeline per
    /// request keeps step state request-local.
    pub fn build_pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(vec![
            Box::new(CodeSnippetExtract),
            Box::new(MaliciousPackageCheck::new(self.package_index.clone())),
            Box::new(SecretRedact),
            Box::new(PiiRedact::new(self.recognizer.clone())),
            Box::new(SystemPromptInject),
            Box::new(MuxResolve::new(self.endpoints.clone())),
        ])
    }

    /// Workspace snapshot for the current session, falling back to the
    /// default workspace if the referenced one is gone.
    pub fn active_workspace(&self) -> crate::workspaces::Workspace {
        let session = self.sessions.current();
        self.workspaces
            .get_by_id(&session.active_workspace_id)
            .or_else(|| self.workspaces.get(DEFAULT_WORKSPACE))
            .expect("default workspace always present")
    }
}

pub fn full_body(data: Bytes) -> BoxBody {
    Full::new(data).map_err(|never| match never {}).boxed()
}

pub fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    let body = serde_json::json!({ "error": { "message": msg, "type": "codegate_error" } });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

fn gateway_error_response(err: &GatewayError) -> Response<BoxBody> {
    error_response(err.status(), &err.to_string())
}

/// Accept loop for the clear proxy port.
pub async fn run(state: Arc<GatewayState>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle_request(req, state).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                if !err.to_string().contains("connection closed") {
                    debug!("connection error from {remote}: {err}");
                }
            }
        });
    }
}

pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{method} {path}");

    if path == "/health" {
        return Ok(Response::builder()
            .header("content-type", "application/json")
            .body(full_body(Bytes::from("{\"status\":\"healthy\"}")))
            .unwrap());
    }

    // Route: the mux entry speaks the OpenAI-compatible dialect; provider
    // prefixes speak their native dialect.
    let mux_rest = path
        .strip_prefix("/v1/mux")
        .filter(|rest| rest.is_empty() || rest.starts_with('/'));
    let (entry_kind, rest_path, mux_requested) = if let Some(rest) = mux_rest {
        let rest = if rest.is_empty() { "/v1/chat/completions" } else { rest };
        (ProviderKind::OpenAi, rest.to_string(), true)
    } else if let Some((kind, rest)) = ProviderKind::from_path(&path) {
        (kind, rest, false)
    } else {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            &format!("unknown provider prefix: {path}"),
        ));
    };

    if method != Method::POST {
        // Non-completion traffic (model listings and the like) is passed
        // through verbatim on the direct provider path.
        if !mux_requested {
            return passthrough(req, state, entry_kind, &rest_path).await;
        }
        return Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "POST only"));
    }

    let headers = req.headers().clone();
    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body: {e}");
            return Ok(error_response(StatusCode::BAD_REQUEST, "failed to read request body"));
        }
    };

    Ok(process(state, entry_kind, &rest_path, headers, body_bytes, mux_requested, None).await)
}

/// The shared processing core: normalize, run the request pipeline,
/// forward, drive the response pipeline. Used by the clear proxy and by
/// the TLS interceptor (which pins the upstream base to the dialed host).
pub async fn process(
    state: Arc<GatewayState>,
    entry_kind: ProviderKind,
    rest_path: &str,
    headers: hyper::HeaderMap,
    body_bytes: Bytes,
    mux_requested: bool,
    upstream_base: Option<&str>,
) -> Response<BoxBody> {
    state.stats.add_request(body_bytes.len() as u64);

    // Invalid JSON is fatal, not a local step failure.
    let body_json: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid JSON body: {e}"),
            )
        }
    };

    let request = match providers::normalize_in(entry_kind, rest_path, &body_json) {
        Ok(r) => r,
        // A body the normalizer cannot read is the client's problem.
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    // Snapshots captured at pipeline entry; a mid-flight workspace
    // activation does not retarget this request.
    let session = state.sessions.current();
    let workspace = state.active_workspace();
    let store = state.sessions.current_store();
    let mut ctx = PipelineContext::new(entry_kind, workspace, session, store, mux_requested);

    let verdict = match state.build_pipeline().run(request, &mut ctx) {
        Ok(v) => v,
        Err(e) => return gateway_error_response(&e),
    };

    match verdict {
        Verdict::Reply(reply) => {
            record_audit(&state, &ctx, &body_json, None, "chat");
            reply_response(&state, &ctx, entry_kind, reply, &body_json)
        }
        Verdict::Forward(outbound) => {
            let Some(mut route) = ctx.route.clone() else {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "pipeline finished without a route",
                );
            };
            // The interceptor already knows where the client was dialing.
            if let Some(base) = upstream_base {
                route.endpoint.base_url = base.trim_end_matches('/').to_string();
            }
            let upstream_body = providers::denormalize(route.endpoint.kind, &outbound);
            record_audit(
                &state,
                &ctx,
                &upstream_body,
                Some(route.endpoint.kind),
                outbound.kind.as_str(),
            );

            let target_path = if mux_requested {
                providers::upstream_path(route.endpoint.kind, outbound.kind)
            } else {
                rest_path
            };
            let url = format!("{}{}", route.endpoint.base_url, target_path);

            let response = match upstream::send(
                &state.client,
                &url,
                &headers,
                &route.endpoint,
                &upstream_body,
            )
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("upstream request failed: {e}");
                    return gateway_error_response(&e);
                }
            };

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                let body = response.bytes().await.unwrap_or_default();
                let msg = String::from_utf8_lossy(&body).into_owned();
                return error_response(
                    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::UNAUTHORIZED),
                    &format!("upstream rejected credentials: {msg}"),
                );
            }

            // Upstream errors come back as plain JSON even on streaming
            // requests; only a healthy response is relayed as a stream.
            let is_stream =
                status.is_success() && (upstream::is_streaming(&response) || outbound.stream);
            let output_ctx = OutputContext {
                store: ctx.store.clone(),
                secrets_redacted: ctx.secrets_redacted,
                pii_redacted: ctx.pii_redacted,
                prompt_id: ctx.prompt_id.clone(),
                model: outbound.model.clone(),
            };
            let output_pipeline = OutputPipeline::new(
                vec![
                    Box::new(UnredactStep::new()),
                    Box::new(RedactionNoticeStep::new()),
                    Box::new(PersistOutputsStep::new(state.db.clone())),
                ],
                output_ctx,
            );

            if is_stream {
                stream_response(
                    state.clone(),
                    response,
                    entry_kind,
                    route.endpoint.kind,
                    output_pipeline,
                )
            } else {
                full_response(
                    state.clone(),
                    response,
                    entry_kind,
                    route.endpoint.kind,
                    output_pipeline,
                    &outbound,
                )
                .await
            }
        }
    }
}

/// Relay a non-completion request (GET /models etc.) without inspection.
async fn passthrough(
    req: Request<hyper::body::Incoming>,
    state: Arc<GatewayState>,
    kind: ProviderKind,
    rest_path: &str,
) -> Result<Response<BoxBody>, hyper::Error> {
    let Some(endpoint) = state.endpoints.get_by_name(kind.as_str()) else {
        return Ok(error_response(StatusCode::BAD_REQUEST, "unknown provider"));
    };
    let method = req.method().clone();
    let headers = req.headers().clone();
    let url = format!("{}{}", endpoint.base_url, rest_path);

    match upstream::relay(&state.client, method, &url, &headers, &endpoint).await {
        Ok((status, resp_headers, body)) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
            for (name, value) in resp_headers.iter() {
                let lowered = name.as_str().to_lowercase();
                if lowered == "content-length" || lowered == "transfer-encoding" {
                    continue;
                }
                if let (Ok(n), Ok(v)) = (
                    hyper::header::HeaderName::from_bytes(name.as_ref()),
                    hyper::header::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    builder = builder.header(n, v);
                }
            }
            Ok(builder.body(full_body(body)).unwrap())
        }
        Err(e) => Ok(gateway_error_response(&e)),
    }
}

/// A locally synthesized reply (policy block), in the entry provider's
/// shape, streamed when the client asked for streaming.
fn reply_response(
    state: &GatewayState,
    ctx: &PipelineContext,
    entry_kind: ProviderKind,
    reply: LocalReply,
    original_body: &Value,
) -> Response<BoxBody> {
    info!(step = %reply.step_name, "serving locally synthesized reply");
    state.stats.add_redactions(ctx.redaction_count() as u64);
    let wants_stream = original_body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !wants_stream {
        let body = providers::encode_full_response(entry_kind, &reply.model, &reply.content);
        return Response::builder()
            .header("content-type", "application/json")
            .body(full_body(Bytes::from(body.to_string())))
            .unwrap();
    }

    let mut bytes = Vec::new();
    let chunks = [
        StreamChunk::text(0, reply.content),
        StreamChunk {
            seq: 1,
            delta: Delta::Finish {
                reason: "stop".into(),
            },
            provider_meta: Value::Null,
        },
    ];
    for chunk in &chunks {
        bytes.extend(providers::encode_chunk(entry_kind, chunk));
    }
    bytes.extend(providers::encode_stream_end(entry_kind));

    Response::builder()
        .header("content-type", stream_content_type(entry_kind))
        .body(full_body(Bytes::from(bytes)))
        .unwrap()
}

fn stream_content_type(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Ollama => "application/x-ndjson",
        _ => "text/event-stream",
    }
}

/// Streaming relay: upstream bytes → decode (route dialect) → output
/// pipeline → encode (entry dialect) → client. The mpsc channel is
/// bounded; when the client stalls or disconnects, the relay task observes
/// it within one chunk cycle and drops the upstream stream.
fn stream_response(
    state: Arc<GatewayState>,
    response: reqwest::Response,
    entry_kind: ProviderKind,
    route_kind: ProviderKind,
    mut pipeline: OutputPipeline,
) -> Response<BoxBody> {
    use futures_util::StreamExt;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Frame<Bytes>, hyper::Error>>(32);
    let cross_dialect = !providers::wire_compatible(entry_kind, route_kind);

    tokio::spawn(async move {
        let mut decoder = providers::StreamDecoder::new(route_kind);
        let mut stream = response.bytes_stream();
        let mut client_gone = false;

        'read: while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("upstream stream error: {e}");
                    let err_chunk = StreamChunk {
                        seq: 0,
                        delta: Delta::Error {
                            message: e.to_string(),
                        },
                        provider_meta: Value::Null,
                    };
                    let wire = providers::encode_chunk(entry_kind, &err_chunk);
                    let _ = tx.send(Ok(Frame::data(Bytes::from(wire)))).await;
                    break;
                }
            };
            state.stats.add_response(bytes.len() as u64);
            for chunk in decoder.feed(&bytes) {
                for out in pipeline.push(chunk) {
                    let wire = encode_for_client(entry_kind, out, cross_dialect);
                    if wire.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(Frame::data(Bytes::from(wire)))).await.is_err() {
                        // Client went away; cancel the upstream read.
                        client_gone = true;
                        break 'read;
                    }
                }
            }
        }

        if !client_gone {
            for out in pipeline.finish() {
                let wire = encode_for_client(entry_kind, out, cross_dialect);
                if wire.is_empty() {
                    continue;
                }
                if tx.send(Ok(Frame::data(Bytes::from(wire)))).await.is_err() {
                    return;
                }
            }
            let tail = providers::encode_stream_end(entry_kind);
            if !tail.is_empty() {
                let _ = tx.send(Ok(Frame::data(Bytes::from(tail)))).await;
            }
        }
    });

    let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)));
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", stream_content_type(entry_kind))
        .body(body)
        .unwrap()
}

/// Encode one chunk in the client's dialect. Across dialects the retained
/// provider payload is meaningless to the client, so it is dropped and the
/// encoder synthesizes; provider framing events do not cross dialects.
fn encode_for_client(
    entry_kind: ProviderKind,
    mut chunk: StreamChunk,
    cross_dialect: bool,
) -> Vec<u8> {
    if cross_dialect {
        if matches!(chunk.delta, Delta::Control { .. }) {
            return Vec::new();
        }
        chunk.provider_meta = Value::Null;
    }
    providers::encode_chunk(entry_kind, &chunk)
}

/// Non-streamed response: unredact the content in place, fold the notice
/// into the top of the message, re-encode for the client.
async fn full_response(
    state: Arc<GatewayState>,
    response: reqwest::Response,
    entry_kind: ProviderKind,
    route_kind: ProviderKind,
    mut pipeline: OutputPipeline,
    outbound: &GatewayRequest,
) -> Response<BoxBody> {
    let status = response.status();
    let body_bytes = response.bytes().await.unwrap_or_default();
    state.stats.add_response(body_bytes.len() as u64);

    let Ok(mut body_json) = serde_json::from_slice::<Value>(&body_bytes) else {
        return Response::builder()
            .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
            .body(full_body(body_bytes))
            .unwrap();
    };

    let content = providers::extract_full_content(route_kind, &body_json).unwrap_or_default();
    let mut chunks = pipeline.push(StreamChunk::text(0, content));
    chunks.extend(pipeline.finish());
    let rewritten: String = chunks
        .iter()
        .filter_map(|c| match &c.delta {
            Delta::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();

    let out_body = if providers::wire_compatible(entry_kind, route_kind) {
        providers::patch_full_content(route_kind, &mut body_json, &rewritten);
        body_json
    } else {
        providers::encode_full_response(entry_kind, &outbound.model, &rewritten)
    };

    Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
        .header("content-type", "application/json")
        .body(full_body(Bytes::from(out_body.to_string())))
        .unwrap()
}


/// Record the (already redacted) prompt and the pipeline's alerts.
/// Best-effort; the audit log may lag the client.
fn record_audit(
    state: &GatewayState,
    ctx: &PipelineContext,
    outbound_body: &Value,
    route_kind: Option<ProviderKind>,
    request_kind: &str,
) {
    state.stats.add_redactions(ctx.redaction_count() as u64);
    let Some(db) = &state.db else { return };

    let provider = route_kind.unwrap_or(ctx.provider).as_str().to_string();
    let record = PromptRecord {
        id: ctx.prompt_id.clone(),
        workspace_id: ctx.workspace.id.clone(),
        timestamp: chrono::Utc::now(),
        provider,
        request: outbound_body.to_string(),
        kind: request_kind.to_string(),
    };
    if let Err(e) = db.record_prompt(&record) {
        warn!("failed to persist prompt: {e}");
    }
    for alert in &ctx.alerts {
        if let Err(e) = db.record_alert(alert) {
            warn!("failed to persist alert: {e}");
        }
    }
    if !ctx.alerts.is_empty() {
        info!(count = ctx.alerts.len(), "alerts recorded for prompt");
    }
}

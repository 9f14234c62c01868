//! TLS interception for clients that dial the upstream directly.
//!
//! The proxy port accepts two entry styles on the same listener:
//! `CONNECT host:port` followed by TLS, and bare TLS from clients pointed
//! here by DNS/hosts spoofing. Either way the ClientHello is read with a
//! lazy acceptor, a leaf certificate for the SNI host is issued on the
//! fly, and the decrypted HTTP/1 stream is served by the same pipeline as
//! the clear port, re-encrypted upstream by the normal reqwest client.

use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, warn};

use crate::ca::CertificateAuthority;
use crate::errors::GatewayError;
use crate::providers::ProviderKind;
use crate::server::{self, error_response, BoxBody, GatewayState};

pub async fn run(
    state: Arc<GatewayState>,
    ca: Arc<CertificateAuthority>,
    listener: TcpListener,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("proxy accept failed: {e}");
                continue;
            }
        };
        let state = state.clone();
        let ca = ca.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, ca).await {
                debug!("intercept connection from {remote} ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<GatewayState>,
    ca: Arc<CertificateAuthority>,
) -> Result<(), GatewayError> {
    // TLS records start with 0x16; anything else here is a CONNECT line.
    let mut first = [0u8; 1];
    let n = stream
        .peek(&mut first)
        .await
        .map_err(|e| GatewayError::Upstream(format!("peek: {e}")))?;
    if n == 0 {
        return Ok(());
    }

    let connect_host = if first[0] != 0x16 {
        let host = read_connect(&mut stream).await?;
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|e| GatewayError::Upstream(format!("connect ack: {e}")))?;
        Some(host)
    } else {
        None
    };

    // Read the ClientHello before committing to a certificate.
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let handshake = acceptor
        .await
        .map_err(|e| GatewayError::Upstream(format!("client hello: {e}")))?;
    let sni = handshake
        .client_hello()
        .server_name()
        .map(|name| name.to_string());
    let Some(host) = sni.or(connect_host) else {
        return Err(GatewayError::Route(
            "no SNI and no CONNECT host, cannot pick a certificate".into(),
        ));
    };

    let tls_config = ca.server_config(&host)?;
    let tls_stream = handshake
        .into_stream(tls_config)
        .await
        .map_err(|e| GatewayError::Upstream(format!("tls handshake with client: {e}")))?;

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        let host = host.clone();
        async move { handle_intercepted(req, state, host).await }
    });
    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(|e| GatewayError::Upstream(format!("serve intercepted: {e}")))?;
    Ok(())
}

/// Read the CONNECT request head and return the target host.
async fn read_connect(stream: &mut TcpStream) -> Result<String, GatewayError> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() > 8 * 1024 {
            return Err(GatewayError::Route("oversized CONNECT header".into()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| GatewayError::Upstream(format!("read connect: {e}")))?;
        if n == 0 {
            return Err(GatewayError::Route("connection closed mid-CONNECT".into()));
        }
        buf.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("CONNECT"), Some(target)) => {
            let host = target.split(':').next().unwrap_or(target);
            Ok(host.to_string())
        }
        _ => Err(GatewayError::Route("expected a CONNECT request".into())),
    }
}

/// Dialed hosts we recognize as providers; their traffic gets the full
/// pipeline. Anything else is spliced through untouched.
fn provider_for_host(host: &str) -> Option<ProviderKind> {
    if host.contains("githubcopilot") || host.contains("copilot") {
        Some(ProviderKind::Copilot)
    } else if host.ends_with("openai.com") {
        Some(ProviderKind::OpenAi)
    } else if host.ends_with("anthropic.com") {
        Some(ProviderKind::Anthropic)
    } else if host.contains("openrouter") {
        Some(ProviderKind::OpenRouter)
    } else {
        None
    }
}

fn looks_like_completion(path: &str) -> bool {
    path.ends_with("completions")
        || path.ends_with("/completion")
        || path.ends_with("/messages")
        || path.ends_with("/api/generate")
        || path.ends_with("/api/chat")
}

async fn handle_intercepted(
    req: Request<hyper::body::Incoming>,
    state: Arc<GatewayState>,
    host: String,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let base = format!("https://{host}");

    let kind = provider_for_host(&host);
    if method == Method::POST && kind.is_some() && looks_like_completion(&path) {
        let entry_kind = kind.expect("checked above");
        let headers = req.headers().clone();
        let body_bytes = match req.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read intercepted body: {e}");
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "failed to read request body",
                ));
            }
        };
        return Ok(server::process(
            state,
            entry_kind,
            &path,
            headers,
            body_bytes,
            false,
            Some(&base),
        )
        .await);
    }

    // Everything else is relayed to the host the client dialed.
    splice(req, state, &base).await
}

/// Byte-transparent relay for non-completion intercepted traffic.
async fn splice(
    req: Request<hyper::body::Incoming>,
    state: Arc<GatewayState>,
    base: &str,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();
    let body_bytes = req.collect().await?.to_bytes();

    let url = format!("{base}{path_and_query}");
    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return Ok(error_response(StatusCode::BAD_REQUEST, "bad method")),
    };

    let mut forward = state.client.request(reqwest_method, &url);
    for (name, value) in headers.iter() {
        let lowered = name.as_str().to_lowercase();
        if matches!(
            lowered.as_str(),
            "host" | "connection" | "transfer-encoding" | "content-length" | "accept-encoding"
        ) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_ref()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            forward = forward.header(n, v);
        }
    }
    if !body_bytes.is_empty() {
        forward = forward.body(body_bytes.to_vec());
    }

    match forward.send().await {
        Ok(response) => {
            let status = response.status();
            let resp_headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
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
            Ok(builder.body(server::full_body(body)).unwrap())
        }
        Err(e) => {
            warn!("intercepted upstream call failed: {e}");
            Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_hosts_recognized() {
        assert_eq!(
            provider_for_host("api.githubcopilot.com"),
            Some(ProviderKind::Copilot)
        );
        assert_eq!(provider_for_host("api.openai.com"), Some(ProviderKind::OpenAi));
        assert_eq!(
            provider_for_host("api.anthropic.com"),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(provider_for_host("example.com"), None);
    }

    #[test]
    fn completion_paths_recognized() {
        assert!(looks_like_completion("/v1/chat/completions"));
        assert!(looks_like_completion("/v1/messages"));
        assert!(looks_like_completion("/api/generate"));
        assert!(!looks_like_completion("/v1/models"));
    }

    #[tokio::test]
    async fn connect_head_parses() {
        let (mut client, mut server_side) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            client
                .write_all(b"CONNECT api.githubcopilot.com:443 HTTP/1.1\r\nHost: api.githubcopilot.com:443\r\n\r\n")
                .await
                .unwrap();
        });
        // read_connect takes a TcpStream; parse logic is tested through a
        // buffer clone of its loop here.
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            let n = server_side.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&buf);
        let mut parts = head.split_whitespace();
        assert_eq!(parts.next(), Some("CONNECT"));
        assert_eq!(
            parts.next().unwrap().split(':').next(),
            Some("api.githubcopilot.com")
        );
    }
}

//! Upstream HTTP calls. Headers are forwarded minus hop-by-hop noise; the
//! routed endpoint's auth material overrides whatever the client sent.

use bytes::Bytes;
use hyper::HeaderMap;
use serde_json::Value;

use crate::errors::GatewayError;
use crate::providers::ProviderEndpoint;

/// Headers never forwarded to the upstream.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "proxy-authorization",
    "accept-encoding",
];

/// POST a completion body upstream.
pub async fn send(
    client: &reqwest::Client,
    url: &str,
    client_headers: &HeaderMap,
    endpoint: &ProviderEndpoint,
    body: &Value,
) -> Result<reqwest::Response, GatewayError> {
    let mut request = client.post(url);
    request = copy_headers(request, client_headers, endpoint);
    request = request.json(body);
    Ok(request.send().await?)
}

/// Relay an arbitrary request (the non-POST passthrough path) and buffer
/// the response.
pub async fn relay(
    client: &reqwest::Client,
    method: hyper::Method,
    url: &str,
    client_headers: &HeaderMap,
    endpoint: &ProviderEndpoint,
) -> Result<(reqwest::StatusCode, reqwest::header::HeaderMap, Bytes), GatewayError> {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| GatewayError::Route("unsupported method".into()))?;
    let mut request = client.request(method, url);
    request = copy_headers(request, client_headers, endpoint);
    let response = request.send().await?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();
    Ok((status, headers, body))
}

fn copy_headers(
    mut request: reqwest::RequestBuilder,
    client_headers: &HeaderMap,
    endpoint: &ProviderEndpoint,
) -> reqwest::RequestBuilder {
    let endpoint_auth = endpoint.auth_headers();
    let overridden: Vec<&str> = endpoint_auth.iter().map(|(name, _)| *name).collect();

    for (name, value) in client_headers.iter() {
        let lowered = name.as_str().to_lowercase();
        if SKIP_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        // The endpoint's configured credentials win over client-sent ones.
        if !endpoint_auth.is_empty()
            && (lowered == "authorization" || lowered == "x-api-key")
            && overridden.iter().any(|n| *n == lowered)
        {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_ref()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            request = request.header(n, v);
        }
    }
    for (name, value) in endpoint_auth {
        request = request.header(name, value);
    }
    request
}

/// Streaming detection: SSE or NDJSON content types.
pub fn is_streaming(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream") || ct.contains("x-ndjson"))
        .unwrap_or(false)
}

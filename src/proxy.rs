// src/proxy.rs
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{
        header::{self, HeaderName},
        uri::PathAndQuery,
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::hub::BroadcastHub;
use crate::rewrite;
use crate::transport::{HyperExecutor, OutboundRequest, RetryPolicy, RetryingTransport};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// State shared by the proxy, push-connection and trigger handlers.
pub struct ProxyState {
    pub target: Uri,
    pub html_only: bool,
    pub transport: RetryingTransport<HyperExecutor>,
    pub hub: Arc<BroadcastHub>,
}

impl ProxyState {
    pub fn new(app_config: &AppConfig, hub: Arc<BroadcastHub>) -> Self {
        Self::with_retry_policy(app_config, hub, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        app_config: &AppConfig,
        hub: Arc<BroadcastHub>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            target: app_config.target.clone(),
            html_only: app_config.html_only,
            transport: RetryingTransport::new(HyperExecutor::new(), policy),
            hub,
        }
    }
}

/// Forwards a browser request to the origin and injects the live-reload script into the answer.
///
/// # Arguments
/// * `state` - Shared proxy state holding the target and the retrying transport.
/// * `client_addr` - Peer address, appended to `X-Forwarded-For`.
/// * `request` - The browser's request. Its body is buffered so it can be replayed.
///
/// # Returns
/// The origin's response with hop-by-hop headers removed and the script injected, or
/// `502 Bad Gateway` when the origin stays unreachable for the whole retry budget.
pub async fn forward(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match proxy_request(&state, client_addr, request).await {
        Ok(response) => {
            debug!(method = %method, path = %path, status = %response.status(), "Proxied request");
            response
        }
        Err(ProxyError::RetryExhausted { attempts, source }) => {
            error!(method = %method, path = %path, attempts, error = %source, "Origin unreachable, giving up");
            (StatusCode::BAD_GATEWAY, "Origin server unreachable\n").into_response()
        }
        Err(e @ ProxyError::Body(_)) => {
            warn!(method = %method, path = %path, error = %e, "Proxy body error");
            (StatusCode::BAD_GATEWAY, "Failed to read body\n").into_response()
        }
        Err(e @ ProxyError::Request(_)) => {
            error!(method = %method, path = %path, error = %e, "Proxy request error");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to build request\n").into_response()
        }
    }
}

async fn proxy_request(
    state: &ProxyState,
    client_addr: SocketAddr,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await?;
    let is_head = parts.method == Method::HEAD;

    let outbound = OutboundRequest {
        uri: target_uri(&state.target, &parts.uri)?,
        headers: outbound_headers(&parts.headers, &state.target, client_addr),
        method: parts.method,
        body,
    };

    let response = state.transport.execute(&outbound).await?;
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    if is_head || !has_body(parts.status) {
        return Ok(Response::from_parts(parts, body));
    }

    let mut body = axum::body::to_bytes(body, usize::MAX).await?;
    if rewrite::is_rewritable(&parts.headers, state.html_only) {
        body = rewrite::rewrite(body);
    }
    rewrite::set_content_length(&mut parts.headers, body.len());

    Ok(Response::from_parts(parts, Body::from(body)))
}

fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Points `inbound` at `target`, joining their paths and merging their queries.
pub fn target_uri(target: &Uri, inbound: &Uri) -> Result<Uri, ProxyError> {
    let path = join_paths(target.path(), inbound.path());
    let query = match (target.query(), inbound.query()) {
        (Some(t), Some(i)) if !t.is_empty() && !i.is_empty() => Some(format!("{}&{}", t, i)),
        (Some(t), _) if !t.is_empty() => Some(t.to_string()),
        (_, Some(i)) if !i.is_empty() => Some(i.to_string()),
        _ => None,
    };
    let path_and_query = match query {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    let mut uri_parts = target.clone().into_parts();
    uri_parts.path_and_query = Some(
        PathAndQuery::from_str(&path_and_query).map_err(axum::http::Error::from)?,
    );
    Ok(Uri::from_parts(uri_parts).map_err(axum::http::Error::from)?)
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn outbound_headers(inbound: &HeaderMap, target: &Uri, client_addr: SocketAddr) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);

    // The origin must answer with a plain body for the script to be injected.
    headers.remove(header::ACCEPT_ENCODING);

    headers.remove(header::HOST);
    if let Some(host) = target
        .authority()
        .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    {
        headers.insert(header::HOST, host);
    }

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

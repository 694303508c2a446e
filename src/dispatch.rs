use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    HeaderMap, Method, Request, Response, StatusCode, Uri,
    header::{self, HeaderValue},
};
use hyper::{Body, body::HttpBody};
use tracing::{debug, error, info, warn};
use url::{Url, form_urlencoded};

use crate::{
    ProxyConfig, ProxyError,
    classify::{self, ContentKind, DocumentKind},
    fetch::{self, HttpClient, UpstreamRequest, UpstreamResponse},
    headers,
    rewrite::{self, LinkRewriter},
};

pub(crate) struct AppState {
    pub client: HttpClient,
    pub config: ProxyConfig,
}

/// Inbound request as seen by the pipeline.
struct ProxyRequest {
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    /// Externally visible URL of this proxy (scheme, host, path).
    proxy_base: Url,
    peer: SocketAddr,
}

pub(crate) async fn handle_request(
    state: Arc<AppState>,
    req: Request<Body>,
    peer: SocketAddr,
) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }

    let method = req.method().clone();
    match proxy_request(&state, req, peer).await {
        Ok(response) => response,
        Err(err) => {
            if err.status().is_server_error() {
                error!(%err, %method, "proxy request failed");
            } else {
                debug!(%err, %method, "rejected proxy request");
            }
            err.into_response()
        }
    }
}

async fn proxy_request(
    state: &AppState,
    req: Request<Body>,
    peer: SocketAddr,
) -> Result<Response<Body>, ProxyError> {
    let config = &state.config;
    let proxy_base = proxy_base(&req, config)?;
    let target = extract_target(req.uri(), &proxy_base)?;

    let (parts, body) = req.into_parts();
    let body = if fetch::forwards_body(&parts.method) {
        Some(hyper::body::to_bytes(body).await?)
    } else {
        None
    };
    let request = ProxyRequest {
        method: parts.method,
        headers: parts.headers,
        body,
        proxy_base,
        peer,
    };

    let upstream_headers = config.header_policy.upstream_headers(
        &request.headers,
        &target,
        Some(request.peer.ip()),
        request.body.is_some(),
    );
    let upstream = fetch::fetch(
        &state.client,
        UpstreamRequest {
            method: request.method.clone(),
            url: target.clone(),
            headers: upstream_headers,
            body: request.body.clone(),
        },
        config.max_redirects,
        config.request_timeout,
    )
    .await?;

    let content_type = upstream
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let kind = classify::classify(
        content_type,
        &request.method,
        upstream.status,
        &config.rewrite,
    );
    info!(
        method = %request.method,
        target = %target,
        final_url = %upstream.url,
        status = %upstream.status,
        ?kind,
        "proxied request"
    );

    let rewriter = LinkRewriter::new(&request.proxy_base, &upstream.url, &config.rewrite);
    match kind {
        ContentKind::Passthrough => Ok(passthrough_response(upstream, &rewriter)),
        ContentKind::Rewrite(document) => {
            rewrite_response(upstream, document, &rewriter, config).await
        }
    }
}

/// Reads `url` from the query string and checks it is a fetchable, non-looping target.
fn extract_target(uri: &Uri, proxy_base: &Url) -> Result<Url, ProxyError> {
    let raw = uri
        .query()
        .and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "url")
                .map(|(_, value)| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .ok_or(ProxyError::MissingTarget)?;

    let target = Url::parse(&raw).map_err(|_| ProxyError::InvalidTarget(raw.clone()))?;
    if !matches!(target.scheme(), "http" | "https") || target.host_str().is_none() {
        return Err(ProxyError::InvalidTarget(raw));
    }
    if rewrite::same_endpoint(&target, proxy_base) {
        return Err(ProxyError::ProxyLoop(raw));
    }
    Ok(target)
}

/// Scheme and host the caller used to reach us, plus the request path.
fn proxy_base(req: &Request<Body>, config: &ProxyConfig) -> Result<Url, ProxyError> {
    if let Some(base) = config.public_base.as_ref() {
        return Ok(base.clone());
    }

    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https")
        .or_else(|| req.uri().scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| config.bind_addr.to_string());

    let base = format!("{scheme}://{host}{}", req.uri().path());
    Url::parse(&base).map_err(|_| ProxyError::InvalidHost(host))
}

fn passthrough_response(upstream: UpstreamResponse, rewriter: &LinkRewriter<'_>) -> Response<Body> {
    let mut headers = headers::response_headers(&upstream.headers, false);
    rewrite_location(&mut headers, rewriter);
    build_response(upstream.status, headers, upstream.body)
}

async fn rewrite_response(
    upstream: UpstreamResponse,
    document: DocumentKind,
    rewriter: &LinkRewriter<'_>,
    config: &ProxyConfig,
) -> Result<Response<Body>, ProxyError> {
    let content_encoding = upstream
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let raw = read_document(
        upstream.body,
        config.request_timeout,
        config.max_document_bytes,
    )
    .await
    .map_err(|err| match err {
        ProxyError::UpstreamUnavailable(reason) => {
            ProxyError::UpstreamUnavailable(format!("{}: {reason}", upstream.url))
        }
        other => other,
    })?;

    let decoded = match classify::decode_body_with_encoding(&raw, content_encoding.as_deref()) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(%err, url = %upstream.url, "failed to decode upstream body; skipping rewrite");
            let mut headers = headers::response_headers(&upstream.headers, false);
            rewrite_location(&mut headers, rewriter);
            return Ok(build_response(upstream.status, headers, Body::from(raw)));
        }
    };

    let content_type = upstream
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let text = classify::decode_text(&decoded, content_type);
    let rewritten = rewriter.rewrite_document(document, &text)?;

    let mut headers = headers::response_headers(&upstream.headers, true);
    rewrite_location(&mut headers, rewriter);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(document.content_type()),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    Ok(build_response(upstream.status, headers, Body::from(rewritten)))
}

/// Buffers a document that is about to be rewritten, bounded in both time and size.
async fn read_document(body: Body, timeout: Duration, limit: usize) -> Result<Bytes, ProxyError> {
    tokio::time::timeout(timeout, collect_limited(body, limit))
        .await
        .map_err(|_| {
            ProxyError::UpstreamUnavailable(format!(
                "timed out after {}s reading upstream body",
                timeout.as_secs_f32()
            ))
        })?
}

async fn collect_limited(mut body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(ProxyError::UpstreamBody)?;
        if buffer.len() + chunk.len() > limit {
            return Err(ProxyError::DocumentTooLarge(limit));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

/// A `Location` that survives redirect following (e.g. on 201) is sent back through the proxy.
fn rewrite_location(headers: &mut HeaderMap, rewriter: &LinkRewriter<'_>) {
    let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let rewritten = rewriter.rewrite_reference(location).into_owned();
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(header::LOCATION, value);
    }
}

fn preflight_response() -> Response<Body> {
    build_response(
        StatusCode::NO_CONTENT,
        headers::preflight_headers(),
        Body::empty(),
    )
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

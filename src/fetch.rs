use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri, header};
use hyper::{Body, Client, client::HttpConnector};
use hyper_rustls::HttpsConnectorBuilder;
use tracing::debug;
use url::Url;

use crate::{ProxyError, headers};

pub(crate) type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub(crate) fn build_client() -> HttpClient {
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder().build(https)
}

/// One outbound request; replayed (possibly rewritten) on every redirect hop.
#[derive(Clone, Debug)]
pub(crate) struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

pub(crate) struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Where the document actually came from once redirects were followed.
    pub url: Url,
    pub body: Body,
}

/// Whether the inbound body travels upstream. Read-only methods never carry one.
pub(crate) fn forwards_body(method: &Method) -> bool {
    method != Method::GET && method != Method::HEAD
}

/// Sends `request`, following redirects, bounded by `timeout` until response headers arrive.
pub(crate) async fn fetch(
    client: &HttpClient,
    request: UpstreamRequest,
    max_redirects: usize,
    timeout: Duration,
) -> Result<UpstreamResponse, ProxyError> {
    tokio::time::timeout(timeout, follow_redirects(client, request, max_redirects))
        .await
        .map_err(|_| {
            ProxyError::UpstreamUnavailable(format!(
                "timed out after {}s waiting for upstream",
                timeout.as_secs_f32()
            ))
        })?
}

async fn follow_redirects(
    client: &HttpClient,
    mut request: UpstreamRequest,
    max_redirects: usize,
) -> Result<UpstreamResponse, ProxyError> {
    let mut hops = 0;
    loop {
        let response = client
            .request(build_request(&request)?)
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(format!("{}: {err}", request.url)))?;

        let status = response.status();
        let Some(next) = redirect_target(status, response.headers(), &request.url) else {
            let (parts, body) = response.into_parts();
            return Ok(UpstreamResponse {
                status,
                headers: parts.headers,
                url: request.url,
                body,
            });
        };

        if hops >= max_redirects {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "too many redirects (limit {max_redirects}) starting at {}",
                request.url
            )));
        }
        hops += 1;
        debug!(from = %request.url, to = %next, %status, "following upstream redirect");
        request = redirected(request, status, next);
    }
}

fn build_request(request: &UpstreamRequest) -> Result<Request<Body>, ProxyError> {
    let mut url = request.url.clone();
    url.set_fragment(None);
    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|_| ProxyError::InvalidTarget(request.url.to_string()))?;

    let body = match request.body.as_ref() {
        Some(bytes) => Body::from(bytes.clone()),
        None => Body::empty(),
    };
    let mut outbound = Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .body(body)?;
    *outbound.headers_mut() = request.headers.clone();
    Ok(outbound)
}

/// The absolute URL a redirect response points at, if it is one we follow.
fn redirect_target(status: StatusCode, headers: &HeaderMap, current: &Url) -> Option<Url> {
    if !matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    let next = current.join(location.trim()).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

fn redirected(mut request: UpstreamRequest, status: StatusCode, next: Url) -> UpstreamRequest {
    let switch_to_get = (status == StatusCode::SEE_OTHER && request.method != Method::HEAD)
        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
            && request.method == Method::POST);
    if switch_to_get {
        request.method = Method::GET;
        request.body = None;
        headers::remove_body_headers(&mut request.headers);
    }

    headers::strip_credentials_on_origin_change(&mut request.headers, &request.url, &next);
    if let Some(authority) = headers::authority(&next)
        && let Ok(value) = header::HeaderValue::from_str(&authority)
    {
        request.headers.insert(header::HOST, value);
    }
    request.url = next;
    request
}

use std::net::IpAddr;

use http::{
    HeaderMap,
    header::{self, HeaderName, HeaderValue},
};
use url::Url;

/// Connection-scoped headers that never cross the proxy in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Metadata added by the proxy's own edge (CDN, load balancer) about the caller.
const CLIENT_IDENTITY_HEADERS: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-real-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-connecting-ipv6",
    "cf-ray",
    "cf-ipcountry",
    "cf-visitor",
    "cf-worker",
    "cdn-loop",
];

/// Request headers whose value is replaced by the target's origin instead of being dropped.
const ORIGIN_REWRITTEN_HEADERS: &[&str] = &["origin", "referer"];

/// Response headers that stop the page from being framed or constrain what it may load.
const FRAMING_HEADERS: &[&str] = &[
    "x-frame-options",
    "frame-options",
    "content-security-policy",
    "content-security-policy-report-only",
    "x-content-type-options",
    "x-xss-protection",
    "referrer-policy",
    "permissions-policy",
    "strict-transport-security",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
];

const CORS_HEADER_NAMES: &[&str] = &[
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
    "access-control-expose-headers",
    "access-control-allow-credentials",
    "access-control-max-age",
    "access-control-allow-private-network",
];

/// Headers describing the encoded payload; stale once the body has been rewritten.
const PAYLOAD_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "content-md5",
    "content-digest",
    "etag",
];

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const BROWSER_ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// How the outbound request headers are produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestHeaderMode {
    /// Forward the caller's headers minus hop-by-hop and client-identity metadata.
    #[default]
    Forward,
    /// Send a fixed desktop-browser header set, ignoring what the caller sent.
    Impersonate,
}

/// Whether the caller's address is revealed to the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientIpPolicy {
    #[default]
    Strip,
    /// Re-add `X-Forwarded-For` / `X-Real-IP` from `cf-connecting-ip`, else the peer address.
    FromConnectingIp,
}

#[derive(Clone, Debug, Default)]
pub struct HeaderPolicy {
    pub request_mode: RequestHeaderMode,
    pub client_ip: ClientIpPolicy,
}

impl HeaderPolicy {
    /// Builds the header set sent to `target` for an inbound request carrying `inbound`.
    pub fn upstream_headers(
        &self,
        inbound: &HeaderMap,
        target: &Url,
        peer: Option<IpAddr>,
        forwards_body: bool,
    ) -> HeaderMap {
        let mut headers = match self.request_mode {
            RequestHeaderMode::Forward => forwarded_headers(inbound, target),
            RequestHeaderMode::Impersonate => impersonated_headers(inbound, forwards_body),
        };

        if let Some(authority) = authority(target)
            && let Ok(value) = HeaderValue::from_str(&authority)
        {
            headers.insert(header::HOST, value);
        }

        if self.client_ip == ClientIpPolicy::FromConnectingIp {
            let client_ip = inbound
                .get("cf-connecting-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| peer.map(|ip| ip.to_string()));
            if let Some(ip) = client_ip
                && let Ok(value) = HeaderValue::from_str(&ip)
            {
                headers.insert("x-forwarded-for", value.clone());
                headers.insert("x-real-ip", value);
            }
        }

        headers
    }
}

fn forwarded_headers(inbound: &HeaderMap, target: &Url) -> HeaderMap {
    let origin = HeaderValue::from_str(&target_origin(target)).ok();

    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str();
        if lower == "host"
            || HOP_BY_HOP_HEADERS.contains(&lower)
            || CLIENT_IDENTITY_HEADERS.contains(&lower)
        {
            continue;
        }
        if ORIGIN_REWRITTEN_HEADERS.contains(&lower) {
            if let Some(origin) = origin.as_ref() {
                out.insert(name.clone(), origin.clone());
            }
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn impersonated_headers(inbound: &HeaderMap, forwards_body: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    out.insert(
        header::USER_AGENT,
        HeaderValue::from_static(BROWSER_USER_AGENT),
    );
    out.insert(header::ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    out.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE),
    );
    out.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static(BROWSER_ACCEPT_ENCODING),
    );
    if forwards_body && let Some(content_type) = inbound.get(header::CONTENT_TYPE) {
        out.insert(header::CONTENT_TYPE, content_type.clone());
    }
    out
}

/// `<scheme>://<host>[:port]/`, the referrer the target is shown.
pub(crate) fn target_origin(target: &Url) -> String {
    format!("{}/", target.origin().ascii_serialization())
}

/// Value for the `Host` header: host plus any non-default port.
pub(crate) fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Copies upstream response headers for the caller with framing protections removed and
/// CORS opened up. `strip_payload_headers` is set when the body is about to be replaced.
pub(crate) fn response_headers(upstream: &HeaderMap, strip_payload_headers: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) {
            continue;
        }
        if strip_payload_headers && PAYLOAD_HEADERS.contains(&lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    strip_framing_headers(&mut out);
    strip_cors_headers(&mut out);
    add_cors_headers(&mut out);
    out
}

fn strip_framing_headers(headers: &mut HeaderMap) {
    for name in FRAMING_HEADERS {
        headers.remove(*name);
    }
    headers.insert("x-frame-options", HeaderValue::from_static("ALLOWALL"));
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("*"),
    );
}

fn strip_cors_headers(headers: &mut HeaderMap) {
    for name in CORS_HEADER_NAMES {
        headers.remove(*name);
    }
}

/// Headers answering a CORS pre-flight.
pub(crate) fn preflight_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, X-Requested-With"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    headers
}

/// Drops headers that must not follow a redirect to `next` from `current`.
pub(crate) fn strip_credentials_on_origin_change(headers: &mut HeaderMap, current: &Url, next: &Url) {
    if current.origin() != next.origin() {
        for name in [header::AUTHORIZATION, header::COOKIE, header::PROXY_AUTHORIZATION] {
            headers.remove(name);
        }
    }
}

pub(crate) fn remove_body_headers(headers: &mut HeaderMap) {
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_ENCODING,
        HeaderName::from_static("content-md5"),
    ] {
        headers.remove(name);
    }
}

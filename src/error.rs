use http::{Response, StatusCode, header};
use hyper::Body;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("missing ?url= parameter (usage: ?url=https://example.com)")]
    MissingTarget,
    #[error("invalid target url '{0}': expected an absolute http(s) url")]
    InvalidTarget(String),
    #[error("invalid Host header '{0}'")]
    InvalidHost(String),
    #[error("proxy loop blocked: target '{0}' points back at this proxy")]
    ProxyLoop(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream document exceeds the {0} byte rewrite limit")]
    DocumentTooLarge(usize),
    #[error("failed to read upstream body: {0}")]
    UpstreamBody(#[source] hyper::Error),
    #[error("html rewrite failed: {0}")]
    Rewrite(#[from] lol_html::errors::RewritingError),
    #[error("failed to build request: {0}")]
    Http(#[from] http::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingTarget
            | ProxyError::InvalidTarget(_)
            | ProxyError::InvalidHost(_)
            | ProxyError::ProxyLoop(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing response; always readable cross-origin so the framing page can show it.
    pub fn into_response(self) -> Response<Body> {
        let mut response = text_response(self.status(), &self.to_string());
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::HeaderValue::from_static("*"),
        );
        response
    }
}

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

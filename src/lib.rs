//! Forwarding proxy that lets third-party pages render inside a frame.
//!
//! `GET /?url=<absolute url>` fetches the target, strips framing and CSP headers, and rewrites
//! links in HTML and CSS so navigation and sub-resources come back through the proxy.

mod classify;
mod dispatch;
mod error;
mod fetch;
mod headers;
pub mod rewrite;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info};
use url::Url;

pub use classify::DocumentKind;
pub use error::ProxyError;
pub use headers::{ClientIpPolicy, HeaderPolicy, RequestHeaderMode};
pub use rewrite::{LinkRewriter, RewriteOptions};

use dispatch::AppState;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// Externally visible base used in rewritten links; derived from each request when unset.
    pub public_base: Option<Url>,
    pub header_policy: HeaderPolicy,
    pub rewrite: RewriteOptions,
    /// Upper bound on connecting to the target and receiving its response headers, and again
    /// on buffering a document that is rewritten.
    pub request_timeout: Duration,
    pub max_redirects: usize,
    /// Largest upstream body (as received, before decompression) buffered for rewriting.
    pub max_document_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_base: None,
            header_policy: HeaderPolicy::default(),
            rewrite: RewriteOptions::default(),
            request_timeout: Duration::from_secs(30),
            max_redirects: 10,
            max_document_bytes: 16 * 1024 * 1024,
        }
    }
}

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

pub async fn spawn_proxy(config: ProxyConfig) -> Result<ProxyHandle, ProxyError> {
    let listener = std::net::TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let state = Arc::new(AppState {
        client: fetch::build_client(),
        config,
    });

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let peer = conn.remote_addr();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, hyper::Error>(dispatch::handle_request(state, req, peer).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(%err, "proxy server error");
        }
    });
    info!(addr = %local_addr, "frame proxy listening");

    Ok(ProxyHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use frame_proxy::{
    ClientIpPolicy, HeaderPolicy, ProxyConfig, RequestHeaderMode, RewriteOptions, spawn_proxy,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "frame-proxy", author, version)]
struct Options {
    /// Address the HTTP server binds to
    #[arg(long, default_value = "0.0.0.0:8080", env = "FRAME_PROXY_BIND")]
    bind: SocketAddr,
    /// Public URL of this proxy used in rewritten links (defaults to the request's Host)
    #[arg(long, env = "FRAME_PROXY_PUBLIC_BASE")]
    public_base: Option<Url>,
    /// Send a fixed desktop-browser header set instead of forwarding the caller's headers
    #[arg(long)]
    impersonate_browser: bool,
    /// Re-add X-Forwarded-For / X-Real-IP from cf-connecting-ip or the peer address
    #[arg(long)]
    forward_client_ip: bool,
    /// Leave stylesheets and style attributes untouched
    #[arg(long)]
    no_css: bool,
    /// Leave inline scripts untouched
    #[arg(long)]
    no_scripts: bool,
    /// Inject a notice at the bottom of proxied pages
    #[arg(long)]
    banner: bool,
    /// Seconds to wait for the target's response headers
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    /// Redirects followed before giving up
    #[arg(long, default_value_t = 10)]
    max_redirects: usize,
    /// Largest HTML/CSS body buffered for rewriting
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    max_document_bytes: usize,
    /// Do not inject the script that stops pages from breaking out of the frame
    #[arg(long)]
    allow_frame_busting: bool,
}

impl Options {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            bind_addr: self.bind,
            public_base: self.public_base,
            header_policy: HeaderPolicy {
                request_mode: if self.impersonate_browser {
                    RequestHeaderMode::Impersonate
                } else {
                    RequestHeaderMode::Forward
                },
                client_ip: if self.forward_client_ip {
                    ClientIpPolicy::FromConnectingIp
                } else {
                    ClientIpPolicy::Strip
                },
            },
            rewrite: RewriteOptions {
                rewrite_css: !self.no_css,
                rewrite_scripts: !self.no_scripts,
                inject_banner: self.banner,
                neutralize_frame_busting: !self.allow_frame_busting,
                ..RewriteOptions::default()
            },
            request_timeout: Duration::from_secs(self.timeout_secs),
            max_redirects: self.max_redirects,
            max_document_bytes: self.max_document_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing();

    let handle = spawn_proxy(options.into_config()).await?;
    tracing::info!(addr = %handle.addr, "ready");

    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    tracing::info!("shutdown signal received");
}

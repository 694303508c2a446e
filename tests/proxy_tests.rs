use std::{
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use flate2::{Compression, write::GzEncoder};
use frame_proxy::{ProxyConfig, RewriteOptions, spawn_proxy};
use hyper::{
    Body, Request, Response, Server, StatusCode,
    http::request::Parts,
    service::{make_service_fn, service_fn},
};
use reqwest::Method;
use tokio::{sync::oneshot, task::JoinHandle};

type Handler = Arc<dyn Fn(Parts, Bytes) -> Response<Body> + Send + Sync + 'static>;

struct TestProxy {
    addr: SocketAddr,
    handle: Option<frame_proxy::ProxyHandle>,
    client: reqwest::Client,
}

impl TestProxy {
    async fn spawn() -> Self {
        Self::spawn_with(ProxyConfig::default()).await
    }

    async fn spawn_with(config: ProxyConfig) -> Self {
        let config = ProxyConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..config
        };

        let handle = spawn_proxy(config).await.expect("failed to start proxy");

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client");

        Self {
            addr: handle.addr,
            handle: Some(handle),
            client,
        }
    }

    fn base(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// What a rewritten reference to `absolute` looks like.
    fn proxied(&self, absolute: &str) -> String {
        format!("{}?url={}", self.base(), urlencoding::encode(absolute))
    }

    async fn fetch(&self, target: &str) -> reqwest::Response {
        self.request(Method::GET, Some(target), &[], None).await
    }

    async fn request(
        &self,
        method: Method,
        target: Option<&str>,
        headers: &[(&str, &str)],
        body: Option<&'static str>,
    ) -> reqwest::Response {
        let mut request = self.client.request(method, self.base());
        if let Some(target) = target {
            request = request.query(&[("url", target)]);
        }
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await.expect("request")
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

struct TestHttpBackend {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestHttpBackend {
    async fn serve(handler: Handler) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .expect("bind backend");
        listener.set_nonblocking(true).expect("set nonblocking");
        let addr = listener.local_addr().expect("local addr");

        let make_svc = make_service_fn(move |_conn| {
            let handler = handler.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = hyper::body::to_bytes(body).await?;
                        Ok::<_, hyper::Error>((handler)(parts, body))
                    }
                }))
            }
        });

        let server = Server::from_tcp(listener)
            .expect("server from tcp")
            .serve(make_svc);
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = server.with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(err) = server.await {
                eprintln!("backend server error: {err}");
            }
        });

        Self {
            addr,
            shutdown: Some(tx),
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn respond(status: StatusCode, headers: &[(&str, &str)], body: impl Into<Body>) -> Response<Body> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(body.into()).unwrap()
}

fn html(body: &'static str) -> Response<Body> {
    respond(
        StatusCode::OK,
        &[("content-type", "text/html; charset=utf-8")],
        body,
    )
}

#[tokio::test]
async fn missing_url_parameter_is_bad_request() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.request(Method::GET, None, &[], None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(response.text().await.unwrap().contains("url"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn invalid_target_is_bad_request() {
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch("not a url").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    proxy.shutdown().await;
}

#[tokio::test]
async fn proxying_the_proxy_is_blocked() {
    let proxy = TestProxy::spawn().await;

    let own = format!("http://{}/?url=https%3A%2F%2Fexample.com%2F", proxy.addr);
    let response = proxy.fetch(&own).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("loop"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn preflight_short_circuits_without_upstream() {
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .request(
            Method::OPTIONS,
            Some("http://127.0.0.1:1/never-contacted"),
            &[],
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["access-control-allow-methods"],
        "GET, POST, OPTIONS"
    );
    assert_eq!(
        headers["access-control-allow-headers"],
        "Content-Type, X-Requested-With"
    );
    assert_eq!(headers["access-control-max-age"], "86400");

    proxy.shutdown().await;
}

#[tokio::test]
async fn html_is_rewritten_and_unframed() {
    let backend = TestHttpBackend::serve(Arc::new(|parts: Parts, _: Bytes| {
        assert_eq!(parts.uri.path(), "/dir/index.html");
        respond(
            StatusCode::OK,
            &[
                ("content-type", "text/html"),
                ("x-frame-options", "DENY"),
                ("content-security-policy", "frame-ancestors 'none'"),
                ("content-security-policy-report-only", "default-src 'self'"),
                ("strict-transport-security", "max-age=63072000"),
                ("etag", "\"v1\""),
            ],
            concat!(
                r#"<html><head><meta http-equiv="Content-Security-Policy" content="frame-ancestors 'none'">"#,
                r#"<link rel="stylesheet" href="/style.css"></head>"#,
                r##"<body><a href="page2.html">next</a><a href="#top">top</a>"##,
                r#"<img srcset="a.png 1x, b.png 2x"></body></html>"#,
            ),
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/dir/index.html")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["content-type"], "text/html; charset=utf-8");
    assert_eq!(headers["access-control-allow-origin"], "*");
    let frame_options: Vec<_> = headers.get_all("x-frame-options").iter().collect();
    assert_eq!(frame_options, vec!["ALLOWALL"]);
    assert!(headers.get("content-security-policy").is_none());
    assert!(headers.get("content-security-policy-report-only").is_none());
    assert!(headers.get("strict-transport-security").is_none());
    assert!(headers.get("etag").is_none());

    let body = response.text().await.unwrap();
    assert!(body.contains(&proxy.proxied(&backend.url("/style.css"))), "{body}");
    assert!(body.contains(&proxy.proxied(&backend.url("/dir/page2.html"))), "{body}");
    assert!(body.contains(r##"href="#top""##), "{body}");
    assert!(
        body.contains(&format!(
            "{} 1x, {} 2x",
            proxy.proxied(&backend.url("/dir/a.png")),
            proxy.proxied(&backend.url("/dir/b.png"))
        )),
        "{body}"
    );
    assert!(!body.contains("frame-ancestors"), "{body}");
    assert!(body.contains("<head><script>window.top = window.self;"), "{body}");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn binary_bodies_pass_through_untouched() {
    let payload: Vec<u8> = (0..65_536u32).map(|i| (i * 7 % 256) as u8).collect();
    let served = payload.clone();
    let backend = TestHttpBackend::serve(Arc::new(move |_: Parts, _: Bytes| {
        respond(
            StatusCode::OK,
            &[("content-type", "image/png"), ("x-frame-options", "DENY")],
            served.clone(),
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/logo.png")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(response.headers()["x-frame-options"], "ALLOWALL");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), payload.len());
    assert_eq!(body.as_ref(), payload.as_slice());

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn redirects_are_followed_and_resolve_against_final_url() {
    let backend = TestHttpBackend::serve(Arc::new(|parts: Parts, _: Bytes| match parts.uri.path() {
        "/old" => respond(StatusCode::FOUND, &[("location", "/new/page")], Body::empty()),
        "/new/page" => html(r#"<a href="next">next</a>"#),
        _ => respond(StatusCode::NOT_FOUND, &[], Body::empty()),
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/old")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("location").is_none());
    let body = response.text().await.unwrap();
    assert!(body.contains(&proxy.proxied(&backend.url("/new/next"))), "{body}");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn redirect_loops_are_reported_as_upstream_failures() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        respond(StatusCode::FOUND, &[("location", "/again")], Body::empty())
    }))
    .await;
    let proxy = TestProxy::spawn_with(ProxyConfig {
        max_redirects: 3,
        ..Default::default()
    })
    .await;

    let response = proxy.fetch(&backend.url("/again")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("too many redirects"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn post_forwards_method_body_and_target_origin() {
    let backend = TestHttpBackend::serve(Arc::new(|parts: Parts, body: Bytes| {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        let echo = format!(
            "{} {} origin={} referer={} host={} xff={} body={}",
            parts.method,
            parts.uri.path(),
            header("origin"),
            header("referer"),
            header("host"),
            header("x-forwarded-for"),
            String::from_utf8_lossy(&body)
        );
        respond(StatusCode::CREATED, &[("content-type", "text/plain")], echo)
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy
        .request(
            Method::POST,
            Some(&backend.url("/submit")),
            &[
                ("origin", "https://embedder.test"),
                ("referer", "https://embedder.test/page"),
                ("x-forwarded-for", "198.51.100.1"),
                ("content-type", "application/x-www-form-urlencoded"),
            ],
            Some("a=1&b=2"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let origin = format!("http://{}/", backend.addr);
    assert_eq!(
        response.text().await.unwrap(),
        format!(
            "POST /submit origin={origin} referer={origin} host={} xff=- body=a=1&b=2",
            backend.addr
        )
    );

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_is_internal_error() {
    let closed = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .expect("bind probe");
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let proxy = TestProxy::spawn().await;
    let response = proxy.fetch(&format!("http://{addr}/")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(response.text().await.unwrap().contains("upstream unavailable"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn compressed_html_is_decoded_before_rewriting() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"<html><body><img src="/pic.jpg"></body></html>"#)
            .unwrap();
        respond(
            StatusCode::OK,
            &[("content-type", "text/html"), ("content-encoding", "gzip")],
            encoder.finish().unwrap(),
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
    let body = response.text().await.unwrap();
    assert!(body.contains(&proxy.proxied(&backend.url("/pic.jpg"))), "{body}");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn upstream_error_status_is_preserved() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        respond(
            StatusCode::NOT_FOUND,
            &[("content-type", "text/html")],
            r#"<a href="/home">home</a>"#,
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/missing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.text().await.unwrap();
    assert!(body.contains(&proxy.proxied(&backend.url("/home"))), "{body}");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn stylesheets_are_rewritten_when_enabled() {
    let handler: Handler = Arc::new(|_: Parts, _: Bytes| {
        respond(
            StatusCode::OK,
            &[("content-type", "text/css")],
            "body{background:url('img/bg.png')}",
        )
    });
    let backend = TestHttpBackend::serve(handler).await;

    let proxy = TestProxy::spawn().await;
    let response = proxy.fetch(&backend.url("/css/site.css")).await;
    assert_eq!(response.headers()["content-type"], "text/css; charset=utf-8");
    let body = response.text().await.unwrap();
    assert_eq!(
        body,
        format!(
            "body{{background:url('{}')}}",
            proxy.proxied(&backend.url("/css/img/bg.png"))
        )
    );
    proxy.shutdown().await;

    let proxy = TestProxy::spawn_with(ProxyConfig {
        rewrite: RewriteOptions {
            rewrite_css: false,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let response = proxy.fetch(&backend.url("/css/site.css")).await;
    assert_eq!(response.headers()["content-type"], "text/css");
    assert_eq!(
        response.text().await.unwrap(),
        "body{background:url('img/bg.png')}"
    );
    proxy.shutdown().await;

    backend.shutdown().await;
}

#[tokio::test]
async fn stalled_document_body_times_out() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        let (mut sender, body) = Body::channel();
        tokio::spawn(async move {
            let _ = sender.send_data(Bytes::from_static(b"<html><body>")).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sender);
        });
        respond(StatusCode::OK, &[("content-type", "text/html")], body)
    }))
    .await;
    let proxy = TestProxy::spawn_with(ProxyConfig {
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .await;

    let started = std::time::Instant::now();
    let response = proxy.fetch(&backend.url("/slow")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(response.text().await.unwrap().contains("timed out"));

    proxy.shutdown().await;
    // The backend connection is still parked on the stalled body; dropping it is enough.
    drop(backend);
}

#[tokio::test]
async fn oversized_documents_are_refused() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        html("<html><body><p>far more than sixteen bytes</p></body></html>")
    }))
    .await;
    let proxy = TestProxy::spawn_with(ProxyConfig {
        max_document_bytes: 16,
        ..Default::default()
    })
    .await;

    let response = proxy.fetch(&backend.url("/")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("16 byte"));

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn declared_charset_is_transcoded_to_utf8() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        // "ąę" in ISO-8859-2
        let mut page = b"<p>".to_vec();
        page.extend_from_slice(&[0xB1, 0xEA]);
        page.extend_from_slice(b"</p>");
        respond(
            StatusCode::OK,
            &[("content-type", "text/html; charset=ISO-8859-2")],
            page,
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/pl")).await;
    assert_eq!(response.headers()["content-type"], "text/html; charset=utf-8");
    assert_eq!(response.text().await.unwrap(), "<p>ąę</p>");

    proxy.shutdown().await;
    backend.shutdown().await;
}

#[tokio::test]
async fn not_modified_is_not_rewritten() {
    let backend = TestHttpBackend::serve(Arc::new(|_: Parts, _: Bytes| {
        respond(
            StatusCode::NOT_MODIFIED,
            &[("content-type", "text/html"), ("etag", "\"v1\"")],
            Body::empty(),
        )
    }))
    .await;
    let proxy = TestProxy::spawn().await;

    let response = proxy.fetch(&backend.url("/cached")).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.headers()["etag"], "\"v1\"");

    proxy.shutdown().await;
    backend.shutdown().await;
}

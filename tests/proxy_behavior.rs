//! Per-proxy behavior: request rewriting, the logout transform, the legacy
//! shim fallback and TLS termination.


use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::Router;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use harness::{free_port, self_signed_tls};
use tm1_admsrv::config::{self, Config};
use tm1_admsrv::proxy::{forward_client, ProxyInstance};

/// One request as observed by the stub upstream.
#[derive(Debug, Clone)]
struct Captured {
    method: String,
    path: String,
    query: Option<String>,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// Upstream stub that records every request and answers 200.
struct EchoUpstream {
    url: String,
    captured: Arc<Mutex<Vec<Captured>>>,
    task: JoinHandle<()>,
}

impl EchoUpstream {
    async fn spawn() -> Self {
        let captured: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new()
            .fallback(capture)
            .with_state(Arc::clone(&captured));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            captured,
            task,
        }
    }

    async fn requests(&self) -> Vec<Captured> {
        self.captured.lock().await.clone()
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn capture(
    State(captured): State<Arc<Mutex<Vec<Captured>>>>,
    request: Request,
) -> &'static str {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let content_type = request
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body: Bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap();

    captured.lock().await.push(Captured {
        method,
        path,
        query,
        content_type,
        body: body.to_vec(),
    });
    "ok"
}

/// A config whose URL template points at the given upstream base.
fn proxy_config(upstream_url: &str) -> Config {
    config::from_json(&format!(
        r#"{{
            "tm1-v12": {{
                "databases-url": "http://localhost:4444/tm1/api/v1/Databases",
                "database-url-template": "{upstream_url}/service/Databases('{{{{database}}}}')"
            }}
        }}"#
    ))
    .unwrap()
}

#[tokio::test]
async fn api_v1_requests_are_rebased_onto_the_upstream() {
    let upstream = EchoUpstream::spawn().await;
    let config = proxy_config(&upstream.url);
    let port = free_port();

    let proxy = ProxyInstance::start(
        "X",
        port,
        &config.database_url_template,
        forward_client().unwrap(),
        None,
    )
    .await
    .unwrap();

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/v1/Foo/Bar"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let requests = upstream.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/service/Databases('X')/Foo/Bar");

    proxy.shutdown().await;
}

#[tokio::test]
async fn request_query_is_forwarded() {
    let upstream = EchoUpstream::spawn().await;
    let config = proxy_config(&upstream.url);
    let port = free_port();

    let proxy = ProxyInstance::start(
        "X",
        port,
        &config.database_url_template,
        forward_client().unwrap(),
        None,
    )
    .await
    .unwrap();

    reqwest::get(format!("http://127.0.0.1:{port}/api/v1/Cubes?$top=5"))
        .await
        .unwrap();

    let requests = upstream.requests().await;
    assert_eq!(requests[0].path, "/service/Databases('X')/Cubes");
    assert_eq!(requests[0].query.as_deref(), Some("$top=5"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn logout_is_transformed_into_session_close() {
    let upstream = EchoUpstream::spawn().await;
    let config = proxy_config(&upstream.url);
    let port = free_port();

    let proxy = ProxyInstance::start(
        "X",
        port,
        &config.database_url_template,
        forward_client().unwrap(),
        None,
    )
    .await
    .unwrap();

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/logout"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let requests = upstream.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].path,
        "/service/Databases('X')/ActiveSession/tm1.Close"
    );
    assert_eq!(requests[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(requests[0].body, b"{}");

    proxy.shutdown().await;
}

#[tokio::test]
async fn legacy_shim_answers_when_the_upstream_is_unreachable() {
    // Nothing listens on the target; every forwarded exchange fails.
    let config = proxy_config("http://127.0.0.1:9");
    let port = free_port();

    let proxy = ProxyInstance::start(
        "X",
        port,
        &config.database_url_template,
        forward_client().unwrap(),
        None,
    )
    .await
    .unwrap();
    let base = format!("http://127.0.0.1:{port}");

    let resp = reqwest::get(format!("{base}/api/internal/v1/capabilities"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body[0]["name"], "RunServerExplorer");

    let resp = reqwest::get(format!("{base}/api/internal/v1.1/sandboxes"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "[]");

    let resp = reqwest::get(format!("{base}/api/internal/v2/capabilities"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // A failed exchange on a plain API path is a bad request; anything else
    // is not found.
    let resp = reqwest::get(format!("{base}/api/v1/Cubes")).await.unwrap();
    assert_eq!(resp.status(), 400);
    let resp = reqwest::get(format!("{base}/static/app.js")).await.unwrap();
    assert_eq!(resp.status(), 404);

    proxy.shutdown().await;
}

#[tokio::test]
async fn tls_proxy_serves_the_shim() {
    let config = proxy_config("http://127.0.0.1:9");
    let port = free_port();

    let proxy = ProxyInstance::start(
        "X",
        port,
        &config.database_url_template,
        forward_client().unwrap(),
        Some(self_signed_tls("localhost")),
    )
    .await
    .unwrap();

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let resp = client
        .get(format!("https://localhost:{port}/api/internal/v1/sandboxes"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "[]");

    proxy.shutdown().await;
}

//! Per-database reverse proxy instances.
//!
//! Each instance owns one listener on one allocated port and forwards
//! rewritten requests to the upstream URL rendered for its database. When an
//! exchange cannot be completed upstream the instance answers inline: the
//! legacy internal API resources get their fixed payloads, other API paths
//! get a 400 and anything else a 404.

pub mod rewrite;
pub mod shim;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::UrlTemplate;
use crate::serve;
use rewrite::ForwardPlan;
use shim::ShimMatch;

/// Shared context for one proxy's request handler.
#[derive(Clone)]
struct ProxyContext {
    database: String,
    target: Url,
    client: reqwest::Client,
}

/// A running proxy listener. Dropping the handle does not stop the task;
/// call [`ProxyInstance::shutdown`].
pub struct ProxyInstance {
    database: String,
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyInstance {
    /// Bind the listener and start serving. A bind failure is returned to
    /// the caller, which leaves the server without a port until the next
    /// reconcile.
    pub async fn start(
        database: &str,
        port: u16,
        template: &UrlTemplate,
        client: reqwest::Client,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self> {
        let target: Url = template
            .render(database)
            .parse()
            .context("database URL template rendered an invalid URL")?;

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .with_context(|| format!("failed to bind proxy port {port}"))?;

        info!(
            server = database,
            port,
            redirect_url = %target,
            using_ssl = tls.is_some(),
            "starting server proxy"
        );

        let context = ProxyContext {
            database: database.to_string(),
            target,
            client,
        };
        let app = Router::new()
            .fallback(proxy_request)
            .with_state(context);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve::serve_with_shutdown(
            listener,
            tls.map(TlsAcceptor::from),
            app,
            shutdown_rx,
        ));

        Ok(Self {
            database: database.to_string(),
            port,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signal the listener to stop accepting. Returns immediately; pair
    /// with [`ProxyInstance::shutdown`] to wait for the drain.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop accepting and wait for all in-flight requests to complete.
    pub async fn shutdown(self) {
        info!(server = %self.database, port = self.port, "terminating server proxy");
        self.begin_shutdown();
        if let Err(e) = self.task.await {
            error!(server = %self.database, error = %e, "proxy task failed");
        }
    }
}

/// Build the HTTP client shared by every proxy. Redirects from the upstream
/// are passed back to the caller, not followed.
pub fn forward_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("tm1-admsrv/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build the proxy HTTP client")
}

async fn proxy_request(State(context): State<ProxyContext>, request: Request) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let (status, headers, body) =
        match rewrite::plan_forward(&context.target, &method, &path, query.as_deref()) {
            Some(plan) => match forward(&context, plan, request).await {
                Ok(reply) => reply,
                Err(e) => error_reply(&method, &path, Some(&e)),
            },
            None => error_reply(&method, &path, None),
        };

    debug!(
        server = %context.database,
        method = %method,
        path = %path,
        query = query.as_deref().unwrap_or(""),
        status = status.as_u16(),
        content_length = body.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Perform the upstream exchange. Any transport failure, including one while
/// streaming the response body, surfaces as an error to the inline handler.
async fn forward(
    context: &ProxyContext,
    plan: ForwardPlan,
    request: Request,
) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let (parts, body) = request.into_parts();
    let body = match plan.body_override {
        Some(bytes) => Bytes::from_static(bytes),
        None => axum::body::to_bytes(body, usize::MAX)
            .await
            .context("failed to read request body")?,
    };

    let mut forwarded = HeaderMap::with_capacity(parts.headers.len());
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) || *name == header::HOST || *name == header::CONTENT_LENGTH {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    if let Some(content_type) = plan.content_type {
        forwarded.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
    }

    let upstream = context
        .client
        .request(plan.method, plan.url)
        .headers(forwarded)
        .body(body)
        .send()
        .await
        .context("upstream exchange failed")?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    let to_strip: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name) || **name == header::CONTENT_LENGTH)
        .cloned()
        .collect();
    for name in to_strip {
        headers.remove(name);
    }

    let bytes = upstream
        .bytes()
        .await
        .context("failed to read upstream response")?;
    Ok((status, headers, bytes))
}

/// Inline reply for requests that were not rewritten or whose upstream
/// exchange failed.
fn error_reply(
    method: &Method,
    path: &str,
    error: Option<&anyhow::Error>,
) -> (StatusCode, HeaderMap, Bytes) {
    match shim::match_path(path) {
        ShimMatch::Resource(payload) => {
            if method != Method::GET {
                let mut headers = HeaderMap::new();
                headers.insert(header::ALLOW, HeaderValue::from_static("GET"));
                return (
                    StatusCode::METHOD_NOT_ALLOWED,
                    headers,
                    Bytes::from_static(b"Method Not Allowed"),
                );
            }
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            (StatusCode::OK, headers, Bytes::from(payload.as_bytes()))
        }
        ShimMatch::UnknownInternal => {
            (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::from_static(b"Not Found"))
        }
        ShimMatch::NotInternal => {
            if path.starts_with("/api/") {
                error!(path = %path, error = ?error.map(|e| e.to_string()), "error processing API endpoint");
                (
                    StatusCode::BAD_REQUEST,
                    HeaderMap::new(),
                    Bytes::from_static(b"Bad Request"),
                )
            } else {
                (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::from_static(b"Not Found"))
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

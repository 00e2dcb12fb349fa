//! The development server: serves the output directory and tells connected
//! browsers to reload when pipelines change files.
//!
//! Pipelines never talk to the server. They publish [`Completion`]s on an
//! [`EventBus`]; the server's bridge task turns each into a [`Reload`] and
//! pushes it to every client over Server-Sent Events.

mod clients;
mod reload;

pub use clients::*;
pub use reload::*;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;

use crate::error::{Chainable, Result};
use crate::events::EventBus;

pub const EVENTS_PATH: &str = "/__sluice/events";
pub const CLIENT_PATH: &str = "/__sluice/client.js";

const CLIENT_TAG: &str = "<script src=\"/__sluice/client.js\"></script>";

/// Pages larger than this are served without the reload script.
const MAX_INJECT_BYTES: usize = 16 << 20;

const CLIENT_JS: &str = r#"(() => {
  const events = new EventSource("/__sluice/events");
  events.addEventListener("reload", (event) => {
    const reload = JSON.parse(event.data);
    if (reload.full) {
      location.reload();
      return;
    }

    const stamp = Date.now().toString();
    for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {
      const url = new URL(link.href);
      if (reload.paths.includes(url.pathname)) {
        url.searchParams.set("sluice", stamp);
        link.href = url.toString();
      }
    }
  });
})();
"#;

#[derive(Debug)]
pub struct DevServer {
    root: PathBuf,
    addr: SocketAddr,
    clients: Arc<Clients>,
}

impl DevServer {
    pub fn new<R: Into<PathBuf>>(root: R, addr: SocketAddr, send_timeout: Duration) -> Self {
        DevServer { root: root.into(), addr, clients: Arc::new(Clients::new(send_timeout)) }
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(EVENTS_PATH, get(events))
            .route(CLIENT_PATH, get(client_js))
            .fallback_service(ServeDir::new(&self.root))
            .layer(middleware::map_response(inject_client))
            .with_state(self.clients.clone())
    }

    /// Forwards every completion published on `bus` to the clients until
    /// the bus closes. A subscriber that fell behind sends a full reload.
    pub fn bridge(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let clients = self.clients.clone();
        let root = self.root.clone();
        tokio::spawn(async move {
            loop {
                let reload = match rx.recv().await {
                    Ok(completion) => Reload::from_paths(&root, &completion.changed),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "reload bridge fell behind; reloading fully");
                        Reload::full()
                    }
                    Err(RecvError::Closed) => return,
                };

                let delivered = clients.broadcast(&reload).await;
                tracing::info!(full = reload.full, paths = ?reload.paths, clients = delivered, "reload sent");
            }
        })
    }

    /// Serves until `shutdown` resolves, then disconnects every client and
    /// waits for connections to close.
    pub async fn serve<F>(self, bus: &EventBus, shutdown: F) -> Result<()>
        where F: Future<Output = ()> + Send + 'static
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await
            .chain_with(|| error! {
                "failed to bind the dev server",
                "address" => self.addr,
            })?;

        let addr = listener.local_addr()?;
        tracing::info!(url = %format!("http://{addr}/"), root = %self.root.display(), "dev server listening");

        let bridge = self.bridge(bus);
        let clients = self.clients.clone();
        let shutdown = async move {
            shutdown.await;
            clients.close_all();
        };

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        bridge.abort();
        served.chain_with(|| "dev server failed")
    }
}

async fn events(State(clients): State<Arc<Clients>>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = clients.connect();
    tracing::info!(client = id, connected = clients.len(), "reload client connected");

    let stream = ReceiverStream::new(rx).map(|reload| {
        let event = match serde_json::to_string(&reload) {
            Ok(json) => Event::default().event("reload").data(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize reload");
                Event::default().event("reload").data(r#"{"paths":[],"full":true}"#)
            }
        };

        Ok::<_, Infallible>(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn client_js() -> impl IntoResponse {
    let headers = [
        (header::CONTENT_TYPE, "text/javascript; charset=utf-8"),
        (header::CACHE_CONTROL, "no-cache"),
    ];

    (headers, CLIENT_JS)
}

/// Inserts the client script tag before the last `</body>`, or appends it
/// to documents without one.
pub fn inject(html: &str) -> String {
    let at = html.to_ascii_lowercase().rfind("</body>").unwrap_or(html.len());
    let mut injected = String::with_capacity(html.len() + CLIENT_TAG.len());
    injected.push_str(&html[..at]);
    injected.push_str(CLIENT_TAG);
    injected.push_str(&html[at..]);
    injected
}

async fn inject_client(response: Response) -> Response {
    let is_html = response.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("text/html"));

    if response.status() != StatusCode::OK || !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_INJECT_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "could not buffer page for script injection");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    let html = inject(&String::from_utf8_lossy(&bytes));
    Response::from_parts(parts, Body::from(html))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tower::ServiceExt;
    use axum::http::Request;

    use super::*;
    use crate::events::Completion;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<html><body><h1>hi</h1></body></html>").unwrap();
        std::fs::write(dir.path().join("css/styles.min.css"), ".a{color:red}").unwrap();
        dir
    }

    fn server(root: &Path) -> DevServer {
        DevServer::new(root, ([127, 0, 0, 1], 0).into(), Clients::DEFAULT_SEND_TIMEOUT)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String, String) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let kind = response.headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, kind, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn script_goes_before_the_closing_body() {
        assert_eq!(inject("<BODY>x</BODY>"), format!("<BODY>x{CLIENT_TAG}</BODY>"));
        assert_eq!(inject("<p>fragment</p>"), format!("<p>fragment</p>{CLIENT_TAG}"));
    }

    #[tokio::test]
    async fn pages_get_the_client_and_assets_do_not() {
        let dir = site();
        let router = server(dir.path()).router();

        let (status, kind, body) = get(router.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(kind.starts_with("text/html"));
        assert_eq!(body, format!("<html><body><h1>hi</h1>{CLIENT_TAG}</body></html>"));

        let (status, _, body) = get(router.clone(), "/css/styles.min.css").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ".a{color:red}");

        let (status, kind, body) = get(router.clone(), CLIENT_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert!(kind.starts_with("text/javascript"));
        assert!(body.contains("new EventSource(\"/__sluice/events\")"));

        let (status, _, _) = get(router, "/missing.html").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completions_reach_connected_clients() {
        let dir = site();
        let server = server(dir.path());
        let (_, mut client) = server.clients().connect();

        let bus = EventBus::default();
        let bridge = server.bridge(&bus);

        bus.emit(Completion {
            pipeline: "styles".into(),
            changed: vec![dir.path().join("css/styles.min.css")],
        });

        let reload = client.recv().await.unwrap();
        assert_eq!(reload, Reload { paths: vec!["/css/styles.min.css".into()], full: false });

        bus.emit(Completion { pipeline: "markup".into(), changed: vec![dir.path().join("index.html")] });
        assert!(client.recv().await.unwrap().full);
        bridge.abort();
    }

    #[tokio::test]
    async fn event_stream_is_served() {
        let dir = site();
        let server = server(dir.path());
        let request = Request::get(EVENTS_PATH).body(Body::empty()).unwrap();
        let response = server.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(server.clients().len(), 1);
    }
}

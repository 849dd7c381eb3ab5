//! Helpers for testing the web server and the classification service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`FixtureServer`] or a [`Server`], make sure it is held until all requests
//!    to it have been made. Dropping it stops the server, and connections to it are refused.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{self, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::stream;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Scores of a resource that is clearly neutral.
pub const NEUTRAL_SCORES: &str =
    r#"{"drawings":3.0,"hentai":0.5,"neutral":92.0,"porn":1.5,"sexy":3.0}"#;

/// Scores of a resource that is clearly explicit.
pub const EXPLICIT_SCORES: &str =
    r#"{"drawings":2.0,"hentai":3.0,"neutral":5.0,"porn":80.0,"sexy":10.0}"#;

/// Scores of a drawing that is not explicit.
pub const DRAWING_SCORES: &str =
    r#"{"drawings":65.0,"hentai":10.0,"neutral":10.0,"porn":5.0,"sexy":10.0}"#;

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the service crates and mutes all other
/// logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("verdict=trace,verdict_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Spawns a server for `router` onto the current runtime.
    pub fn new(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

/// Serves resources to classify, along with a fake model server, and counts every request.
///
/// Routes:
///
///  - `GET /images/{name}`: the scores of a named fixture as JSON, `404` for unknown names.
///    Known names are `neutral`, `explicit` and `drawing`.
///  - `GET /bytes/{size}`: `size` zero bytes, with a `Content-Length`.
///  - `GET /chunked/{size}`: `size` zero bytes, streamed without a `Content-Length`.
///  - `GET /delay/{time}/{*path}`: waits for `time` (e.g. `100ms`), then redirects to `path`.
///  - `GET /respond_statuscode/{num}`: responds with an empty body and the given status.
///  - `GET /echo_header/{name}`: responds with the value of the request header `name`, or `400`.
///  - `POST /classify`: the fake model. A body that is a JSON object is echoed back as scores,
///    anything else is rejected with `422`.
#[derive(Debug)]
pub struct FixtureServer {
    server: Server,
    hits: Hits,
}

impl FixtureServer {
    pub fn new() -> Self {
        let hits: Hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = Arc::clone(&hits);
            move |request: Request, next: Next| {
                let hits = Arc::clone(&hits);
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(request.uri().path().to_owned()).or_default() += 1;
                    }
                    next.run(request).await
                }
            }
        };

        let router = Router::new()
            .route("/images/:name", get(image))
            .route("/bytes/:size", get(sized_bytes))
            .route("/chunked/:size", get(chunked_bytes))
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num",
                get(|extract::Path(num): extract::Path<u16>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route("/echo_header/:name", get(echo_header))
            .route("/classify", post(fake_model))
            .layer(middleware::from_fn(hitcounter));

        Self {
            server: Server::new(router),
            hits,
        }
    }

    /// Returns a full URL pointing to the given path on this server.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The number of requests to `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or_default()
    }

    /// The number of requests to the fake model so far.
    pub fn model_calls(&self) -> usize {
        self.hits("/classify")
    }

    /// The total number of requests so far, excluding the fake model.
    pub fn accesses(&self) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.iter()
            .filter(|(path, _)| *path != "/classify")
            .map(|(_, count)| count)
            .sum()
    }
}

impl Default for FixtureServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn image(extract::Path(name): extract::Path<String>) -> Response {
    let scores = match name.as_str() {
        "neutral" => NEUTRAL_SCORES,
        "explicit" => EXPLICIT_SCORES,
        "drawing" => DRAWING_SCORES,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    ([(header::CONTENT_TYPE, "image/png")], scores).into_response()
}

async fn sized_bytes(extract::Path(size): extract::Path<usize>) -> Vec<u8> {
    vec![0; size]
}

async fn chunked_bytes(extract::Path(size): extract::Path<usize>) -> Body {
    const CHUNK: usize = 16 * 1024;

    let chunks = (0..size).step_by(CHUNK).map(move |offset| {
        let len = CHUNK.min(size - offset);
        Ok::<_, std::io::Error>(Bytes::from(vec![0; len]))
    });
    Body::from_stream(stream::iter(chunks))
}

async fn echo_header(extract::Path(name): extract::Path<String>, headers: HeaderMap) -> Response {
    match headers.get(name.as_str()) {
        Some(value) => value.as_bytes().to_vec().into_response(),
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn fake_model(body: Bytes) -> Response {
    match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&body) {
        Ok(scores) => axum::Json(scores).into_response(),
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY.into_response(),
    }
}

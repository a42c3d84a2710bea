//! Scripted transport for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aqueduct_core::{Config, NetworkError, NetworkErrorKind};
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, Transport};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, NetworkError> + Send + Sync;

/// Answers every request with a closure and records what was sent.
pub(crate) struct MockTransport {
    handler: Box<Handler>,
    delay: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, NetworkError> + Send + Sync + 'static,
    {
        Self::with_delay(handler, None)
    }

    pub(crate) fn with_delay<F>(handler: F, delay: Option<Duration>) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, NetworkError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests with `method` whose path starts with `prefix`.
    pub(crate) fn count(&self, method: Method, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && path_of(r).starts_with(prefix))
            .count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        self.requests.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = (self.handler)(&request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// DNS resolver that never answers, so connection setup hangs until the
/// connect timeout fires.
pub(crate) struct StalledResolver;

impl reqwest::dns::Resolve for StalledResolver {
    fn resolve(&self, _name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        Box::pin(std::future::pending::<
            Result<reqwest::dns::Addrs, Box<dyn std::error::Error + Send + Sync>>,
        >())
    }
}

/// Serves `body` as a JSON 200 to every connection on a local port.
pub(crate) async fn serve_json(body: &'static str) -> (String, tokio::task::JoinHandle<()>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (url, server)
}

pub(crate) fn config(urls: &[&str]) -> Config {
    Config::default().with_urls(urls.iter().copied())
}

pub(crate) fn json(status: u16, body: Value) -> Result<HttpResponse, NetworkError> {
    json_with_headers(status, body, &[])
}

pub(crate) fn json_with_headers(
    status: u16,
    body: Value,
    headers: &[(&str, &str)],
) -> Result<HttpResponse, NetworkError> {
    let mut response = HttpResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: serde_json::to_vec(&body).unwrap(),
    };
    response
        .headers
        .insert("content-type".to_string(), "application/json".to_string());
    Ok(response)
}

pub(crate) fn refused(request: &HttpRequest) -> Result<HttpResponse, NetworkError> {
    Err(NetworkError::new(NetworkErrorKind::ConnectionRefused, &request.url))
}

/// `scheme://authority` part of the request URL.
pub(crate) fn host_of(request: &HttpRequest) -> &str {
    let after_scheme = request.url.find("://").map(|i| i + 3).unwrap_or(0);
    match request.url[after_scheme..].find('/') {
        Some(i) => &request.url[..after_scheme + i],
        None => &request.url,
    }
}

/// Path part of the request URL, without the query string.
pub(crate) fn path_of(request: &HttpRequest) -> &str {
    let rest = &request.url[host_of(request).len()..];
    rest.split('?').next().unwrap_or(rest)
}

pub(crate) fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn body_json(request: &HttpRequest) -> Value {
    request
        .body
        .as_ref()
        .map(|b| serde_json::from_slice(b).unwrap())
        .unwrap_or(Value::Null)
}

//! HTTP transport seam.
//!
//! The executor talks to a [`Transport`] so the dispatch logic does not
//! depend on a particular HTTP stack. [`ReqwestTransport`] is the production
//! implementation.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::time::Duration;

use aqueduct_core::{Config, Error, NetworkError, NetworkErrorKind};
use reqwest::Method;

/// One HTTP exchange as seen by the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Deadline for the whole exchange, connection setup included
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Sends a single HTTP request, reporting failures before a response as
/// classified network errors.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError>;
}

/// reqwest-backed transport with connection reuse.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_builder(reqwest::Client::builder(), config)
    }

    pub(crate) fn with_builder(builder: reqwest::ClientBuilder, config: &Config) -> Result<Self, Error> {
        let mut builder = builder
            .pool_max_idle_per_host(config.pool_size)
            .connect_timeout(config.connect_timeout());

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if !config.ca_cert_path.is_empty() {
            let pem = std::fs::read(&config.ca_cert_path).map_err(|e| {
                Error::Config(format!("failed to read CA certificate {}: {}", config.ca_cert_path, e))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let url = request.url;
        let mut builder = self.client.request(request.method, &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| classify(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify(&url, e))?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Map a reqwest failure onto the network error taxonomy.
fn classify(url: &str, err: reqwest::Error) -> NetworkError {
    let kind = if err.is_connect() {
        if err.is_timeout() {
            NetworkErrorKind::ConnectTimeout
        } else if caused_by_refusal(&err) {
            NetworkErrorKind::ConnectionRefused
        } else {
            NetworkErrorKind::FetchFailed
        }
    } else if err.is_timeout() {
        NetworkErrorKind::ResponseTimeout
    } else {
        NetworkErrorKind::FetchFailed
    };
    NetworkError::new(kind, url).with_source(err)
}

fn caused_by_refusal(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = cause.source();
    }
    false
}

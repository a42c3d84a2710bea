//! Single-attempt request execution and outcome classification.

use std::sync::Arc;
use std::time::Duration;

use aqueduct_core::{
    ApplicationError, Auth, Config, Error, HttpError, NetworkError, NetworkErrorKind, Result, ServerErrorBody,
};
use base64::Engine;
use tokio::sync::watch;
use tracing::debug;

use crate::request::{
    Request, RequestBody, Response, HEADER_ASYNC, HEADER_DIRTY_READ, HEADER_TRANSACTION_ID,
};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Performs exactly one attempt against one host.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    default_headers: Vec<(String, String)>,
    authorization: Option<String>,
    default_timeout: Option<Duration>,
    connect_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        let mut default_headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        default_headers.sort();

        Self {
            transport,
            default_headers,
            authorization: config.auth.as_ref().map(authorization_header),
            default_timeout: config.timeout(),
            connect_timeout: config.connect_timeout(),
            shutdown,
        }
    }

    /// Send `request` to `host` once.
    ///
    /// `deferred` asks the server to store the result as an async job.
    pub async fn execute(
        &self,
        host: &str,
        request: &Request,
        transaction_id: Option<&str>,
        deferred: bool,
    ) -> Result<Response> {
        let http = self.build(host, request, transaction_id, deferred)?;
        let url = http.url.clone();
        let timeout = http.timeout;

        let closed_already = *self.shutdown.borrow();
        if closed_already {
            return Err(NetworkError::new(NetworkErrorKind::RequestAborted, url).into());
        }

        debug!(method = %http.method, url = %url, deferred, "Sending request");

        let send = self.transport.send(http);
        let outcome = tokio::select! {
            result = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, send)
                        .await
                        .unwrap_or_else(|_| Err(NetworkError::new(NetworkErrorKind::ResponseTimeout, &url))),
                    None => send.await,
                }
            } => result,
            _ = closed(self.shutdown.clone()) => {
                Err(NetworkError::new(NetworkErrorKind::RequestAborted, &url))
            }
        };

        let response = outcome?;
        debug!(url = %url, status = response.status, "Received response");
        into_response(host, response)
    }

    fn build(
        &self,
        host: &str,
        request: &Request,
        transaction_id: Option<&str>,
        deferred: bool,
    ) -> Result<HttpRequest> {
        let mut url = format!("{}{}", host, request.path);
        if !request.query.is_empty() {
            url = reqwest::Url::parse_with_params(&url, &request.query)
                .map_err(|e| Error::Config(format!("invalid request url {}: {}", url, e)))?
                .to_string();
        }

        let mut headers = self.default_headers.clone();
        if let Some(authorization) = &self.authorization {
            headers.push(("authorization".to_string(), authorization.clone()));
        }
        headers.extend(request.headers.iter().cloned());

        let body = match &request.body {
            RequestBody::Empty => None,
            RequestBody::Json(value) => {
                headers.push(("content-type".to_string(), "application/json".to_string()));
                Some(serde_json::to_vec(value)?)
            }
            RequestBody::Text(text) => {
                headers.push(("content-type".to_string(), "text/plain".to_string()));
                Some(text.clone().into_bytes())
            }
            RequestBody::Bytes { data, content_type } => {
                headers.push(("content-type".to_string(), content_type.clone()));
                Some(data.clone())
            }
        };

        if request.allow_dirty_read {
            headers.push((HEADER_DIRTY_READ.to_string(), "true".to_string()));
        }
        if let Some(id) = transaction_id {
            headers.push((HEADER_TRANSACTION_ID.to_string(), id.to_string()));
        }
        if deferred {
            headers.push((HEADER_ASYNC.to_string(), "store".to_string()));
        }

        Ok(HttpRequest {
            method: request.method.clone(),
            url,
            headers,
            body,
            // Connection setup has its own limit, so a host that never accepts
            // fails as a connect timeout before the exchange deadline passes
            timeout: request
                .timeout
                .or(self.default_timeout)
                .map(|limit| limit + self.connect_timeout),
        })
    }
}

fn authorization_header(auth: &Auth) -> String {
    match auth {
        Auth::Basic { username, password } => {
            let credentials = format!("{}:{}", username, password);
            format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes())
            )
        }
        Auth::Bearer { token } => format!("Bearer {}", token),
    }
}

/// Resolves once the connection is closed; never if the sender is gone.
async fn closed(mut shutdown: watch::Receiver<bool>) {
    let outcome = shutdown.wait_for(|closed| *closed).await.map(|_| ());
    if outcome.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Split an HTTP answer into success, application error or plain HTTP error.
fn into_response(host: &str, response: HttpResponse) -> Result<Response> {
    if response.status < 400 {
        return Ok(Response {
            status: response.status,
            headers: response.headers,
            body: response.body,
            host: host.to_string(),
        });
    }

    if let Ok(body) = serde_json::from_slice::<ServerErrorBody>(&response.body) {
        if body.error {
            return Err(ApplicationError {
                code: body.code.unwrap_or(response.status),
                error_num: body.error_num,
                message: body.error_message,
            }
            .into());
        }
    }

    Err(HttpError {
        code: response.status,
        body: (!response.body.is_empty()).then(|| String::from_utf8_lossy(&response.body).into_owned()),
    }
    .into())
}

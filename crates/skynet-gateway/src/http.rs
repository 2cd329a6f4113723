//! HTTP/1 gateway client.
//!
//! `POST {endpoint}/action` with the dispatch body, `GET {endpoint}/status`
//! for health. Plain `http://` endpoints only.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{
    DispatchError, DispatchRequest, DispatchResponse, GatewayClient, GatewayStatus, evaluate_response,
};

const USER_AGENT: &str = concat!("skynet/", env!("CARGO_PKG_VERSION"));

/// Gateway client over a fresh HTTP/1 connection per request.
#[derive(Debug, Clone)]
pub struct HttpGatewayClient {
    /// Bound on status requests. Dispatch timeouts are the caller's.
    status_timeout: Duration,
}

impl Default for HttpGatewayClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HttpGatewayClient {
    pub fn new(status_timeout: Duration) -> Self {
        Self { status_timeout }
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes), DispatchError> {
        let target = Target::parse(endpoint, path)?;

        let stream = tokio::net::TcpStream::connect(&target.address)
            .await
            .map_err(|e| {
                debug!(error = %e, uri = %target.uri, "gateway connection failed");
                DispatchError::GatewayUnavailable(format!("{}: {e}", target.address))
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| DispatchError::GatewayUnavailable(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "gateway connection closed with error");
            }
        });

        let payload = match &body {
            Some(value) => Bytes::from(
                serde_json::to_vec(value).map_err(|e| DispatchError::Protocol(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let mut builder = http::Request::builder()
            .method(method)
            .uri(&target.uri)
            .header("host", &target.host)
            .header("user-agent", USER_AGENT);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(payload))
            .map_err(|e| DispatchError::Protocol(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| DispatchError::GatewayUnavailable(format!("request: {e}")))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| DispatchError::GatewayUnavailable(format!("body: {e}")))?
            .to_bytes();

        Ok((status, bytes))
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn execute_task(
        &self,
        endpoint: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let (status, bytes) = self
            .request(Method::POST, endpoint, "/action", Some(request.to_body()))
            .await?;

        check_status(status, &bytes)?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::Protocol(format!("invalid JSON reply: {e}")))?;

        let response = evaluate_response(body);
        if !response.is_success() {
            warn!(task_id = %request.task_id, %endpoint, "gateway reported failure");
        }
        Ok(response)
    }

    async fn get_gateway_status(&self, endpoint: &str) -> Result<GatewayStatus, DispatchError> {
        let (status, bytes) = tokio::time::timeout(
            self.status_timeout,
            self.request(Method::GET, endpoint, "/status", None),
        )
        .await
        .map_err(|_| DispatchError::Timeout(self.status_timeout))??;

        check_status(status, &bytes)?;
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok(GatewayStatus {
            agent_connected: body.get("agent_connected").and_then(Value::as_bool),
            body,
        })
    }
}

/// 5xx means the gateway cannot serve; other non-2xx is a protocol error.
fn check_status(status: StatusCode, body: &[u8]) -> Result<(), DispatchError> {
    if status.is_success() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(body);
    if status.is_server_error() {
        Err(DispatchError::GatewayUnavailable(format!("{status}: {text}")))
    } else {
        Err(DispatchError::Protocol(format!("{status}: {text}")))
    }
}

/// Where to connect and what to ask for.
#[derive(Debug, PartialEq)]
struct Target {
    address: String,
    host: String,
    uri: String,
}

impl Target {
    fn parse(endpoint: &str, path: &str) -> Result<Self, DispatchError> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| DispatchError::Protocol(format!("bad endpoint {endpoint:?}: {e}")))?;

        match uri.scheme_str() {
            Some("http") | None => {}
            Some(other) => {
                return Err(DispatchError::Protocol(format!(
                    "unsupported scheme {other:?} in {endpoint:?}"
                )));
            }
        }

        let authority = uri
            .authority()
            .ok_or_else(|| DispatchError::Protocol(format!("endpoint {endpoint:?} has no host")))?;
        let port = authority.port_u16().unwrap_or(80);
        let address = format!("{}:{port}", authority.host());

        let base = uri.path().trim_end_matches('/');
        Ok(Self {
            uri: format!("http://{address}{base}{path}"),
            host: authority.as_str().to_string(),
            address,
        })
    }
}

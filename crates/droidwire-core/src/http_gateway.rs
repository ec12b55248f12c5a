//! [`RpcGateway`] implementation over the agent's HTTP surface.
//!
//! The agent listens on port 7912 by default and exposes:
//!
//! - `POST /jsonrpc/0` - JSON-RPC 2.0 endpoint for UI actions and queries
//! - `POST /shell` - form-encoded shell execution (`command`, `timeout`)
//! - `GET /info` - device description including the display size
//! - `GET /screenshot/0` - current screen as an image
//! - `GET /app/{package}/info` - package metadata
//! - `GET /version` - liveness probe
//!
//! # Example
//!
//! ```no_run
//! use droidwire_core::gateway::RpcGateway;
//! use droidwire_core::http_gateway::HttpGateway;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = HttpGateway::new("http://192.168.1.20:7912")?;
//! let xml = gateway.dump_hierarchy().await?;
//! println!("{} bytes of hierarchy", xml.len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, debug_span, trace, Instrument};

use crate::error::{DeviceError, RpcError};
use crate::gateway::{RpcGateway, ShellCommand, ShellResponse};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Port the agent listens on when an address omits one.
pub const DEFAULT_AGENT_PORT: u16 = 7912;

/// Default timeout for a JSON-RPC round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the `/version` liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for fetching a screenshot.
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a transport failure, keeping timeouts distinguishable.
fn map_http_error(err: reqwest::Error) -> DeviceError {
    if err.is_timeout() {
        DeviceError::RpcTimeout
    } else {
        DeviceError::Http(err.to_string())
    }
}

/// Reads and parses a JSON body. A timeout while the body is still arriving
/// maps the same way as one before the headers.
async fn read_json(resp: reqwest::Response) -> Result<Value, DeviceError> {
    let bytes = resp.bytes().await.map_err(map_http_error)?;
    serde_json::from_slice(&bytes).map_err(|e| DeviceError::JsonParse(e.to_string()))
}

/// Unwraps a JSON-RPC response envelope into its `result`.
fn decode_rpc_response(method: &str, body: Value) -> Result<Value, DeviceError> {
    match body.get("error") {
        Some(error) if !error.is_null() => Err(RpcError::from_json(error, method).into()),
        _ => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// Decodes the `/shell` response body.
fn decode_shell_response(body: &Value) -> ShellResponse {
    let failed = body.get("error").is_some_and(|e| !e.is_null());
    let exit_code = body
        .get("exitCode")
        .and_then(Value::as_i64)
        .map(|c| c as i32)
        .unwrap_or(if failed { 1 } else { 0 });
    ShellResponse {
        exit_code,
        output: body
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Normalizes `host[:port]` into an agent base URL.
pub fn agent_url(addr: &str) -> String {
    let addr = addr.trim_start_matches("http://");
    if addr.contains(':') {
        format!("http://{addr}")
    } else {
        format!("http://{addr}:{DEFAULT_AGENT_PORT}")
    }
}

// ---------------------------------------------------------------------------
// HttpGateway
// ---------------------------------------------------------------------------

/// HTTP client for a single device agent.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    rpc_timeout: Duration,
}

impl HttpGateway {
    /// Creates a gateway for the agent at `base_url` (e.g. `http://host:7912`).
    ///
    /// No request is made until the first call.
    pub fn new(base_url: impl Into<String>) -> Result<Self, DeviceError> {
        let client = Client::builder()
            .build()
            .map_err(|e| DeviceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rpc_timeout: RPC_TIMEOUT,
        })
    }

    /// Overrides the default JSON-RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probes `addr` over Wi-Fi and returns a gateway if an agent answers.
    ///
    /// The port defaults to [`DEFAULT_AGENT_PORT`]. Returns `Ok(None)` when the
    /// agent answers with an error status.
    pub async fn connect_wifi(addr: &str) -> Result<Option<Self>, DeviceError> {
        let gateway = Self::new(agent_url(addr))?;
        let resp = gateway
            .client
            .get(gateway.url("/version"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_http_error)?;
        if !resp.status().is_success() {
            debug!(status = %resp.status(), addr, "agent probe rejected");
            return Ok(None);
        }
        debug!(base_url = %gateway.base_url, "agent reachable");
        Ok(Some(gateway))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<Value, DeviceError> {
        let resp = self
            .client
            .get(self.url(path))
            .timeout(self.rpc_timeout)
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        read_json(resp).await
    }
}

#[async_trait]
impl RpcGateway for HttpGateway {
    async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        self.call_with_timeout(method, params, self.rpc_timeout).await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DeviceError> {
        let span = debug_span!("rpc_call", method);
        async {
            let request = json!({
                "jsonrpc": "2.0",
                "id": uuid::Uuid::new_v4().simple().to_string(),
                "method": method,
                "params": params,
            });
            trace!(?timeout, "posting jsonrpc request");
            let resp = self
                .client
                .post(self.url("/jsonrpc/0"))
                .json(&request)
                .timeout(timeout)
                .send()
                .await
                .map_err(map_http_error)?
                .error_for_status()
                .map_err(map_http_error)?;
            let body = read_json(resp).await?;
            decode_rpc_response(method, body)
        }
        .instrument(span)
        .await
    }

    async fn shell(
        &self,
        command: &ShellCommand,
        timeout_secs: u64,
    ) -> Result<ShellResponse, DeviceError> {
        let line = command.to_command_line();
        debug!(command = %line, "shell");
        let timeout = timeout_secs.to_string();
        let resp = self
            .client
            .post(self.url("/shell"))
            .form(&[("command", line.as_str()), ("timeout", timeout.as_str())])
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        let body = read_json(resp).await?;
        Ok(decode_shell_response(&body))
    }

    async fn device_info(&self) -> Result<Value, DeviceError> {
        self.get_json("/info").await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        let resp = self
            .client
            .get(self.url("/screenshot/0"))
            .timeout(SCREENSHOT_TIMEOUT)
            .send()
            .await
            .map_err(map_http_error)?
            .error_for_status()
            .map_err(map_http_error)?;
        let bytes = resp.bytes().await.map_err(map_http_error)?;
        debug!(bytes = bytes.len(), "screenshot captured");
        Ok(bytes.to_vec())
    }

    async fn app_info(&self, package: &str) -> Result<Value, DeviceError> {
        let body = self.get_json(&format!("/app/{package}/info")).await?;
        if body.get("success").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(DeviceError::UnexpectedResponse(description.to_string()));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

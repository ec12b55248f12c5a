//! Shared test helpers for droidwire-core integration tests.
//!
//! [`MockGateway`] is a scripted in-process [`RpcGateway`] that records every
//! call. [`mock_http_agent`] is a raw TCP server speaking just enough HTTP
//! to stand in for the on-device agent.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use droidwire_core::device::Device;
use droidwire_core::error::{DeviceError, RpcError};
use droidwire_core::gateway::{RpcGateway, ShellCommand, ShellResponse};

// ---------------------------------------------------------------------------
// Hierarchy fixtures
// ---------------------------------------------------------------------------

/// A dump with a single `OK` button at `[0,0][100,50]`.
pub const OK_DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="OK" resource-id="" class="android.widget.Button" package="com.example" content-desc="" bounds="[0,0][100,50]" />
</hierarchy>"#;

/// Builds a dump with one button per `(text, bounds)` pair under a frame.
pub fn buttons_dump(buttons: &[(&str, &str)]) -> String {
    let mut xml = String::from(
        r#"<hierarchy rotation="0"><node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" bounds="[0,0][1000,1000]">"#,
    );
    for (i, (text, bounds)) in buttons.iter().enumerate() {
        xml.push_str(&format!(
            r#"<node index="{i}" text="{text}" resource-id="com.example:id/b{i}" class="android.widget.Button" package="com.example" content-desc="" bounds="{bounds}" />"#
        ));
    }
    xml.push_str("</node></hierarchy>");
    xml
}

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

/// Scripted outcome of one RPC call.
#[derive(Debug, Clone)]
pub enum Reply {
    Value(Value),
    Timeout,
    Error(i64),
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

/// Pops the front of a script, repeating the last entry once only one is left.
fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// In-process gateway with scripted replies.
///
/// Replies and dumps are consumed in order, and the last one keeps being
/// served. Unscripted RPC methods answer `null`.
pub struct MockGateway {
    display: (u32, u32),
    dumps: Mutex<VecDeque<Option<String>>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, Value)>>,
    shell_outputs: Mutex<HashMap<String, String>>,
    shells: Mutex<Vec<String>>,
    app_infos: Mutex<HashMap<String, Value>>,
    dump_count: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Self::with_display(1000, 1000)
    }

    pub fn with_display(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            display: (width, height),
            dumps: Mutex::new(VecDeque::new()),
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            shell_outputs: Mutex::new(HashMap::new()),
            shells: Mutex::new(Vec::new()),
            app_infos: Mutex::new(HashMap::new()),
            dump_count: AtomicUsize::new(0),
        })
    }

    pub fn push_dump(&self, xml: impl Into<String>) {
        self.dumps.lock().unwrap().push_back(Some(xml.into()));
    }

    pub fn push_dump_failure(&self) {
        self.dumps.lock().unwrap().push_back(None);
    }

    pub fn reply(&self, method: &str, reply: impl Into<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply.into());
    }

    pub fn set_shell_output(&self, command: &str, output: &str) {
        self.shell_outputs
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_string());
    }

    pub fn set_app_info(&self, package: &str, info: Value) {
        self.app_infos
            .lock()
            .unwrap()
            .insert(package.to_string(), info);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Parameters of every call to `method`, in order.
    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|(m, _)| m).collect()
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.shells.lock().unwrap().clone()
    }

    pub fn dump_count(&self) -> usize {
        self.dump_count.load(Ordering::SeqCst)
    }

    fn dumpsys_display(&self) -> String {
        format!(
            "  mViewports=[DisplayViewport{{valid=true, type=INTERNAL, displayId=0, orientation=0, logicalFrame=Rect(0, 0 - {w}, {h}), deviceWidth={w}, deviceHeight={h}, isActive=true}}]\n",
            w = self.display.0,
            h = self.display.1,
        )
    }
}

#[async_trait]
impl RpcGateway for MockGateway {
    async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        self.call_with_timeout(method, params, Duration::from_secs(60))
            .await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        _timeout: Duration,
    ) -> Result<Value, DeviceError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(next_scripted);
        match reply {
            None => Ok(Value::Null),
            Some(Reply::Value(v)) => Ok(v),
            Some(Reply::Timeout) => Err(DeviceError::RpcTimeout),
            Some(Reply::Error(code)) => Err(DeviceError::Rpc(RpcError {
                code,
                message: "scripted failure".to_string(),
                data: Value::Null,
                method: Some(method.to_string()),
            })),
        }
    }

    async fn shell(
        &self,
        command: &ShellCommand,
        _timeout_secs: u64,
    ) -> Result<ShellResponse, DeviceError> {
        let line = command.to_command_line();
        self.shells.lock().unwrap().push(line.clone());
        let scripted = self.shell_outputs.lock().unwrap().get(&line).cloned();
        let output = match scripted {
            Some(out) => out,
            None if line == "dumpsys display" => self.dumpsys_display(),
            None => String::new(),
        };
        Ok(ShellResponse {
            exit_code: 0,
            output,
        })
    }

    async fn device_info(&self) -> Result<Value, DeviceError> {
        Ok(json!({
            "serial": "mock-serial",
            "sdk": 30,
            "display": {"width": self.display.0, "height": self.display.1},
        }))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn app_info(&self, package: &str) -> Result<Value, DeviceError> {
        self.app_infos
            .lock()
            .unwrap()
            .get(package)
            .cloned()
            .ok_or_else(|| DeviceError::UnexpectedResponse(format!("{package} not installed")))
    }

    async fn dump_hierarchy(&self) -> Result<String, DeviceError> {
        self.dump_count.fetch_add(1, Ordering::SeqCst);
        let next = next_scripted(&mut self.dumps.lock().unwrap());
        match next {
            Some(Some(xml)) => Ok(xml),
            _ => Err(DeviceError::EmptyHierarchy),
        }
    }
}

/// A device backed by `mock`.
pub fn device(mock: &Arc<MockGateway>) -> Device {
    let gateway: Arc<dyn RpcGateway> = mock.clone();
    Device::new(gateway)
}

// ---------------------------------------------------------------------------
// Raw HTTP agent
// ---------------------------------------------------------------------------

/// One canned HTTP response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    pub delay: Option<Duration>,
    /// Pause between the headers and the body.
    pub body_delay: Option<Duration>,
}

impl HttpReply {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            delay: None,
            body_delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: "{}".to_string(),
            delay: None,
            body_delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stalled_body(mut self, delay: Duration) -> Self {
        self.body_delay = Some(delay);
        self
    }
}

/// A request as seen by [`mock_http_agent`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let body = String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string();
    Some(RecordedRequest { method, path, body })
}

/// Start a mock agent serving `replies` in order, one connection per reply.
///
/// Every response carries `Connection: close`, so the client opens a fresh
/// connection for each request.
pub async fn mock_http_agent(
    replies: Vec<HttpReply>,
) -> (SocketAddr, Arc<Mutex<Vec<RecordedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let log = recorded.clone();

    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let Some(request) = read_request(&mut stream).await else {
                continue;
            };
            log.lock().unwrap().push(request);

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            let reason = if reply.status == 200 { "OK" } else { "Error" };
            let head = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.status,
                reason,
                reply.body.len(),
            );
            let _ = stream.write_all(head.as_bytes()).await;
            if let Some(delay) = reply.body_delay {
                let _ = stream.flush().await;
                tokio::time::sleep(delay).await;
            }
            let _ = stream.write_all(reply.body.as_bytes()).await;
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
        }
    });

    (addr, recorded)
}

//! Transport-agnostic interface to the on-device automation agent.
//!
//! This module defines the [`RpcGateway`] trait, the minimal surface the rest
//! of the crate needs from the agent: JSON-RPC calls, hierarchy dumps, shell
//! commands and device info. [`HttpGateway`](crate::http_gateway::HttpGateway)
//! is the production implementation; tests substitute scripted gateways.
//!
//! Window-size resolution is a provided method built on the required ones, so
//! every backend gets the same rotation handling.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::DeviceError;

/// Default timeout for shell commands, in seconds.
pub const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 60;

/// Output of one agent-executed shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResponse {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub output: String,
}

/// A shell command line, given either verbatim or as an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Line(String),
    Args(Vec<String>),
}

impl ShellCommand {
    /// The command line sent to the agent. Argument lists are quoted the way
    /// a POSIX shell expects.
    pub fn to_command_line(&self) -> String {
        match self {
            ShellCommand::Line(line) => line.clone(),
            ShellCommand::Args(args) => args
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for ShellCommand {
    fn from(line: &str) -> Self {
        ShellCommand::Line(line.to_string())
    }
}

impl From<String> for ShellCommand {
    fn from(line: String) -> Self {
        ShellCommand::Line(line)
    }
}

impl From<Vec<String>> for ShellCommand {
    fn from(args: Vec<String>) -> Self {
        ShellCommand::Args(args)
    }
}

impl From<&[&str]> for ShellCommand {
    fn from(args: &[&str]) -> Self {
        ShellCommand::Args(args.iter().map(|a| a.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for ShellCommand {
    fn from(args: [&str; N]) -> Self {
        ShellCommand::Args(args.iter().map(|a| a.to_string()).collect())
    }
}

/// Quotes one shell word. Words made only of safe characters pass through.
pub fn shell_quote(word: &str) -> String {
    if word.is_empty() {
        return "''".to_string();
    }
    let safe = word
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

fn display_viewport_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r".*DisplayViewport\{valid=true, .*orientation=(?P<orientation>\d+), .*deviceWidth=(?P<width>\d+), deviceHeight=(?P<height>\d+).*",
        )
        .expect("display viewport pattern is valid")
    })
}

/// Extracts the display rotation (0-3) from `dumpsys display` output.
pub fn parse_display_rotation(dumpsys: &str) -> Option<u32> {
    let re = display_viewport_re();
    dumpsys
        .lines()
        .find_map(|line| re.captures(line))
        .and_then(|caps| caps.name("orientation")?.as_str().parse().ok())
}

/// Swaps width and height when the rotation parity disagrees with the
/// reported orientation of the panel.
pub fn orient_size(width: u32, height: u32, rotation: u32) -> (u32, u32) {
    if (width > height) != (rotation % 2 == 1) {
        (height, width)
    } else {
        (width, height)
    }
}

/// Interface to the automation agent.
///
/// # Required Methods
///
/// Implementors must provide [`call`](RpcGateway::call),
/// [`call_with_timeout`](RpcGateway::call_with_timeout),
/// [`shell`](RpcGateway::shell), [`device_info`](RpcGateway::device_info),
/// and [`screenshot`](RpcGateway::screenshot).
#[async_trait]
pub trait RpcGateway: Send + Sync {
    /// Invoke a remote method with positional (array) or keyword (object)
    /// parameters using the default RPC timeout.
    async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError>;

    /// Like [`call`](Self::call) with an explicit transport timeout.
    ///
    /// A transport timeout surfaces as [`DeviceError::RpcTimeout`].
    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DeviceError>;

    /// Run a shell command on the device.
    async fn shell(
        &self,
        command: &ShellCommand,
        timeout_secs: u64,
    ) -> Result<ShellResponse, DeviceError>;

    /// Static device description (`/info`), including the `display` size.
    async fn device_info(&self) -> Result<Value, DeviceError>;

    /// Capture the current screen as encoded image bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DeviceError>;

    /// Package metadata (main activity, version, ...).
    ///
    /// Not all backends support this. The default implementation returns
    /// an error.
    async fn app_info(&self, _package: &str) -> Result<Value, DeviceError> {
        Err(DeviceError::UnexpectedResponse(
            "app_info not supported by this backend".to_string(),
        ))
    }

    /// Dump the current window hierarchy as XML.
    async fn dump_hierarchy(&self) -> Result<String, DeviceError> {
        let content = self.call("dumpWindowHierarchy", json!([false, null])).await?;
        match content {
            Value::String(s) if s.is_empty() => Err(DeviceError::EmptyHierarchy),
            Value::String(s) => Ok(s),
            Value::Null => Err(DeviceError::EmptyHierarchy),
            other => Err(DeviceError::UnexpectedResponse(format!(
                "hierarchy dump is not a string: {other}"
            ))),
        }
    }

    /// Current display rotation: 0 normal, 1 home key right, 2 upside down,
    /// 3 home key left.
    async fn orientation(&self) -> Result<u32, DeviceError> {
        let resp = self
            .shell(&ShellCommand::from("dumpsys display"), DEFAULT_SHELL_TIMEOUT_SECS)
            .await?;
        if let Some(rotation) = parse_display_rotation(&resp.output) {
            return Ok(rotation);
        }
        let info = self.call("deviceInfo", json!([])).await?;
        info.get("displayRotation")
            .and_then(Value::as_u64)
            .map(|r| r as u32)
            .ok_or_else(|| DeviceError::UnexpectedResponse("deviceInfo has no displayRotation".into()))
    }

    /// Screen size in pixels as `(width, height)`, oriented to the current
    /// rotation.
    async fn window_size(&self) -> Result<(u32, u32), DeviceError> {
        let info = self.device_info().await?;
        let display = info
            .get("display")
            .ok_or_else(|| DeviceError::UnexpectedResponse("device info has no display".into()))?;
        let dim = |name: &str| {
            display
                .get(name)
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .ok_or_else(|| DeviceError::UnexpectedResponse(format!("display has no {name}")))
        };
        let (w, h) = (dim("width")?, dim("height")?);
        let rotation = self.orientation().await?;
        let size = orient_size(w, h, rotation);
        debug!(width = size.0, height = size.1, rotation, "window size resolved");
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("am"), "am");
        assert_eq!(shell_quote("com.example/.Main"), "com.example/.Main");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_command_line_from_args() {
        let cmd = ShellCommand::from(["am", "force-stop", "--user", "0", "com.example app"]);
        assert_eq!(cmd.to_command_line(), "am force-stop --user 0 'com.example app'");

        let raw = ShellCommand::from("pm list users");
        assert_eq!(raw.to_command_line(), "pm list users");
    }

    #[test]
    fn test_parse_display_rotation() {
        let out = "Display Devices: size=1\n  mViewports=[DisplayViewport{valid=true, type=INTERNAL, displayId=0, uniqueId='local:0', physicalPort=0, orientation=1, logicalFrame=Rect(0, 0 - 2400, 1080), physicalFrame=Rect(0, 0 - 2400, 1080), deviceWidth=1080, deviceHeight=2400, isActive=true}]\n";
        assert_eq!(parse_display_rotation(out), Some(1));
        assert_eq!(parse_display_rotation("nothing here"), None);
    }

    #[test]
    fn test_orient_size() {
        // portrait panel, normal rotation
        assert_eq!(orient_size(1080, 2400, 0), (1080, 2400));
        // portrait panel rotated to landscape
        assert_eq!(orient_size(1080, 2400, 1), (2400, 1080));
        // already-landscape report with landscape rotation
        assert_eq!(orient_size(2400, 1080, 3), (2400, 1080));
        // landscape report but device upright
        assert_eq!(orient_size(2400, 1080, 2), (1080, 2400));
    }
}

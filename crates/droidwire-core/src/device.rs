//! The device facade.
//!
//! [`Device`] wraps one [`RpcGateway`] and is the entry point for everything
//! else in the crate: it builds selector-backed [`UiObject`] proxies, XPath
//! queries and watch contexts, and provides coordinate-based input.
//!
//! Coordinates are given as `f64`. A component below `1.0` is read as a
//! fraction of the screen size along that axis; anything else is absolute
//! pixels. The screen size is fetched on first use and cached.
//!
//! # Example
//!
//! ```no_run
//! use droidwire_core::device::Device;
//! use droidwire_core::selector::Selector;
//!
//! # async fn example() -> Result<(), droidwire_core::error::DeviceError> {
//! let device = Device::connect_wifi("192.168.1.20").await?;
//! device.click(0.5, 0.5).await?;
//! device.select(Selector::new().text("Settings")).click(None, None).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::gateway::{RpcGateway, ShellCommand, ShellResponse, DEFAULT_SHELL_TIMEOUT_SECS};
use crate::geometry::{Direction, Point};
use crate::http_gateway::HttpGateway;
use crate::selector::Selector;
use crate::ui_object::{expect_bool, UiObject};
use crate::watch::WatchContext;
use crate::xpath::XPathSelector;

/// Touch actions understood by `injectInputEvent`.
const ACTION_DOWN: i32 = 0;
const ACTION_UP: i32 = 1;
const ACTION_MOVE: i32 = 2;

/// Pause between the two taps of a double click.
const DOUBLE_CLICK_INTERVAL: Duration = Duration::from_millis(100);

/// Swipe steps used when neither steps nor duration is given.
const DEFAULT_SWIPE_STEPS: u32 = 55;

/// The agent moves one swipe step every 5 ms.
const STEPS_PER_SECOND: f64 = 200.0;

fn user_info_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\tUserInfo\{([^:]+):[^:]+:[^:]+\} running")
            .expect("user info pattern is valid")
    })
}

/// Number of swipe steps for the given options.
///
/// Explicit steps win over a duration. The result is never below 2.
pub fn swipe_steps(steps: Option<u32>, duration: Option<Duration>) -> u32 {
    let steps = match (steps, duration) {
        (Some(steps), _) => steps,
        (None, Some(duration)) => (duration.as_secs_f64() * STEPS_PER_SECOND) as u32,
        (None, None) => DEFAULT_SWIPE_STEPS,
    };
    steps.max(2)
}

/// Parses user ids from `pm list users` output, keeping running users only.
pub fn parse_user_ids(output: &str) -> Vec<String> {
    user_info_re()
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Fully qualified `pkg/activity` component. Activities without a dot are
/// taken as relative to the package.
fn component_name(package: &str, activity: &str) -> String {
    if activity.contains('.') {
        format!("{package}/{activity}")
    } else {
        format!("{package}/.{activity}")
    }
}

struct DeviceInner {
    gateway: Arc<dyn RpcGateway>,
    config: DeviceConfig,
    window_size: RwLock<Option<(u32, u32)>>,
}

/// Handle to one device. Cheap to clone; clones share the gateway and the
/// cached window size.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Creates a device over `gateway` with default settings.
    pub fn new(gateway: Arc<dyn RpcGateway>) -> Self {
        Self::with_config(gateway, DeviceConfig::default())
    }

    pub fn with_config(gateway: Arc<dyn RpcGateway>, config: DeviceConfig) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                gateway,
                config,
                window_size: RwLock::new(None),
            }),
        }
    }

    /// Connects to the agent at `addr` (`host` or `host:port`) using the
    /// persisted configuration.
    pub async fn connect_wifi(addr: &str) -> Result<Self, DeviceError> {
        let config = DeviceConfig::load();
        let gateway = HttpGateway::connect_wifi(addr)
            .await?
            .ok_or_else(|| DeviceError::Http(format!("no agent answering at {addr}")))?
            .with_rpc_timeout(config.rpc_timeout());
        Ok(Self::with_config(Arc::new(gateway), config))
    }

    pub fn gateway(&self) -> &Arc<dyn RpcGateway> {
        &self.inner.gateway
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    // -- factories ----------------------------------------------------------

    /// Proxy for the element(s) described by `selector`.
    pub fn select(&self, selector: Selector) -> UiObject {
        UiObject::new(self.clone(), selector)
    }

    /// XPath query from one shorthand selector.
    pub fn xpath(&self, shorthand: &str) -> XPathSelector {
        XPathSelector::new(self.clone(), [shorthand], None)
    }

    /// XPath query whose matches must satisfy every shorthand.
    pub fn xpath_all<I, S>(&self, shorthands: I) -> XPathSelector
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        XPathSelector::new(self.clone(), shorthands, None)
    }

    /// New watch context polling every `interval` (configured default when
    /// `None`), optionally preloaded with the built-in dialog rules and
    /// started right away.
    pub fn watch_context(
        &self,
        builtin: bool,
        interval: Option<Duration>,
        autostart: bool,
    ) -> Result<WatchContext, DeviceError> {
        let interval = interval.unwrap_or_else(|| self.inner.config.watch_interval());
        let mut ctx = WatchContext::new(self.clone(), interval);
        if builtin {
            ctx.with_builtin_rules()?;
        }
        if autostart {
            ctx.start()?;
        }
        Ok(ctx)
    }

    // -- gateway passthroughs -----------------------------------------------

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        self.inner.gateway.call(method, params).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DeviceError> {
        self.inner
            .gateway
            .call_with_timeout(method, params, timeout)
            .await
    }

    /// Runs a shell command with the default timeout.
    pub async fn shell(
        &self,
        command: impl Into<ShellCommand>,
    ) -> Result<ShellResponse, DeviceError> {
        self.shell_with_timeout(command, DEFAULT_SHELL_TIMEOUT_SECS)
            .await
    }

    pub async fn shell_with_timeout(
        &self,
        command: impl Into<ShellCommand>,
        timeout_secs: u64,
    ) -> Result<ShellResponse, DeviceError> {
        self.inner
            .gateway
            .shell(&command.into(), timeout_secs)
            .await
    }

    pub async fn dump_hierarchy(&self) -> Result<String, DeviceError> {
        self.inner.gateway.dump_hierarchy().await
    }

    /// Static description served by the agent (`/info`).
    pub async fn device_info(&self) -> Result<Value, DeviceError> {
        self.inner.gateway.device_info().await
    }

    /// Live device state from the `deviceInfo` RPC (screen on, rotation,
    /// current package, ...).
    pub async fn info(&self) -> Result<Value, DeviceError> {
        self.call("deviceInfo", json!([])).await
    }

    pub async fn screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        self.inner.gateway.screenshot().await
    }

    // -- coordinates --------------------------------------------------------

    /// Screen size as `(width, height)`, fetched once and cached.
    pub async fn window_size(&self) -> Result<(u32, u32), DeviceError> {
        if let Some(size) = *self.inner.window_size.read().await {
            return Ok(size);
        }
        let size = self.inner.gateway.window_size().await?;
        *self.inner.window_size.write().await = Some(size);
        Ok(size)
    }

    /// Drops the cached window size, e.g. after a rotation.
    pub async fn reset_window_size(&self) {
        *self.inner.window_size.write().await = None;
    }

    /// Resolves a possibly relative coordinate pair to pixels.
    pub async fn rel_to_abs(&self, x: f64, y: f64) -> Result<Point, DeviceError> {
        if x < 0.0 || y < 0.0 {
            return Err(DeviceError::InvalidValue {
                field: "coordinate",
                expected: "non-negative",
            });
        }
        if x >= 1.0 && y >= 1.0 {
            return Ok(Point::new(x as i32, y as i32));
        }
        let (w, h) = self.window_size().await?;
        let px = if x < 1.0 { w as f64 * x } else { x };
        let py = if y < 1.0 { h as f64 * y } else { y };
        Ok(Point::new(px as i32, py as i32))
    }

    // -- input --------------------------------------------------------------

    pub async fn click(&self, x: f64, y: f64) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.call("click", json!([p.x, p.y])).await?;
        Ok(())
    }

    pub async fn double_click(&self, x: f64, y: f64) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.inject(ACTION_DOWN, p).await?;
        self.inject(ACTION_UP, p).await?;
        tokio::time::sleep(DOUBLE_CLICK_INTERVAL).await;
        self.call("click", json!([p.x, p.y])).await?;
        Ok(())
    }

    /// Presses at `(x, y)` for `duration`.
    pub async fn long_click(&self, x: f64, y: f64, duration: Duration) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.inject(ACTION_DOWN, p).await?;
        tokio::time::sleep(duration).await;
        self.inject(ACTION_UP, p).await
    }

    pub async fn touch_down(&self, x: f64, y: f64) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.inject(ACTION_DOWN, p).await
    }

    pub async fn touch_move(&self, x: f64, y: f64) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.inject(ACTION_MOVE, p).await
    }

    pub async fn touch_up(&self, x: f64, y: f64) -> Result<(), DeviceError> {
        let p = self.rel_to_abs(x, y).await?;
        self.inject(ACTION_UP, p).await
    }

    async fn inject(&self, action: i32, p: Point) -> Result<(), DeviceError> {
        self.call("injectInputEvent", json!([action, p.x, p.y, 0]))
            .await?;
        Ok(())
    }

    /// Swipes from `from` to `to`. See [`swipe_steps`] for how `steps` and
    /// `duration` combine.
    pub async fn swipe(
        &self,
        from: (f64, f64),
        to: (f64, f64),
        steps: Option<u32>,
        duration: Option<Duration>,
    ) -> Result<bool, DeviceError> {
        let start = self.rel_to_abs(from.0, from.1).await?;
        let end = self.rel_to_abs(to.0, to.1).await?;
        let steps = swipe_steps(steps, duration);
        debug!(?start, ?end, steps, "swipe");
        let result = self
            .call("swipe", json!([start.x, start.y, end.x, end.y, steps]))
            .await?;
        expect_bool("swipe", result)
    }

    /// Swipes across the screen in `direction`, covering `scale` of its
    /// width (horizontal) or from the centre to the edge margin (vertical).
    pub async fn swipe_direction(
        &self,
        direction: Direction,
        scale: f64,
    ) -> Result<bool, DeviceError> {
        let (w, h) = self.window_size().await?;
        let (w, h) = (w as i32, h as i32);
        let h_offset = (w as f64 * (1.0 - scale)) as i32 / 2;
        let v_offset = (h as f64 * (1.0 - scale)) as i32 / 2;

        let center = (w / 2, h / 2);
        let left = (h_offset, h / 2);
        let right = (w - h_offset, h / 2);
        let top = (w / 2, v_offset);
        let bottom = (w / 2, h - v_offset);

        let (from, to) = match direction {
            Direction::Left => (right, left),
            Direction::Right => (left, right),
            Direction::Up => (center, top),
            Direction::Down => (center, bottom),
        };
        let pt = |(x, y): (i32, i32)| (x as f64, y as f64);
        self.swipe(pt(from), pt(to), None, None).await
    }

    // -- apps ---------------------------------------------------------------

    pub async fn app_info(&self, package: &str) -> Result<Value, DeviceError> {
        self.inner.gateway.app_info(package).await
    }

    /// Launches `package`. Without `activity` the main activity is looked up
    /// through [`app_info`](Self::app_info).
    pub async fn app_start(
        &self,
        package: &str,
        activity: Option<&str>,
        stop: bool,
        user_id: Option<&str>,
    ) -> Result<ShellResponse, DeviceError> {
        if stop {
            self.app_stop(package, user_id).await?;
        }
        let activity = match activity {
            Some(activity) => activity.to_string(),
            None => {
                let info = self.app_info(package).await?;
                info.get("mainActivity")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DeviceError::UnexpectedResponse(format!(
                            "{package} has no main activity"
                        ))
                    })?
                    .to_string()
            }
        };
        let component = component_name(package, &activity);
        let mut args = vec![
            "am".to_string(),
            "start".into(),
            "-a".into(),
            "android.intent.action.MAIN".into(),
            "-c".into(),
            "android.intent.category.LAUNCHER".into(),
            "-n".into(),
            component,
        ];
        if let Some(uid) = user_id {
            args.extend(["--user".to_string(), uid.to_string()]);
        }
        self.shell(args).await
    }

    pub async fn app_stop(
        &self,
        package: &str,
        user_id: Option<&str>,
    ) -> Result<ShellResponse, DeviceError> {
        let mut args = vec!["am".to_string(), "force-stop".into()];
        if let Some(uid) = user_id {
            args.extend(["--user".to_string(), uid.to_string()]);
        }
        args.push(package.to_string());
        self.shell(args).await
    }

    /// Ids of the users currently running on the device.
    pub async fn user_ids(&self) -> Result<Vec<String>, DeviceError> {
        let resp = self.shell("pm list users").await?;
        Ok(parse_user_ids(&resp.output))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swipe_steps() {
        assert_eq!(swipe_steps(None, None), 55);
        assert_eq!(swipe_steps(Some(10), None), 10);
        assert_eq!(swipe_steps(None, Some(Duration::from_millis(500))), 100);
        // explicit steps win
        assert_eq!(swipe_steps(Some(20), Some(Duration::from_secs(1))), 20);
        assert_eq!(swipe_steps(Some(0), None), 2);
        assert_eq!(swipe_steps(None, Some(Duration::ZERO)), 2);
    }

    #[test]
    fn test_parse_user_ids() {
        let out = "Users:\n\tUserInfo{0:Owner:c13} running\n\tUserInfo{10:Work profile:1030} running\n\tUserInfo{11:Guest:404}\n";
        assert_eq!(parse_user_ids(out), vec!["0", "10"]);
        assert!(parse_user_ids("").is_empty());
    }

    #[test]
    fn test_component_name() {
        assert_eq!(component_name("com.ex", "Main"), "com.ex/.Main");
        assert_eq!(component_name("com.ex", ".Main"), "com.ex/.Main");
        assert_eq!(component_name("com.ex", "com.ex.ui.Main"), "com.ex/com.ex.ui.Main");
    }
}

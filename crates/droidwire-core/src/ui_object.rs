//! Selector-backed element proxies.
//!
//! A [`UiObject`] pairs a [`Selector`] with the device it targets. It holds
//! no element state: every method is one or more RPC calls that the agent
//! resolves against the live screen. Actions first wait for the element to
//! exist and fail with [`DeviceError::ElementNotFound`] when it never shows.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::DeviceError;
use crate::geometry::{Bounds, Direction, Point, Side};
use crate::selector::Selector;

/// Hold time for [`UiObject::long_click`] when none is given.
const LONG_CLICK: Duration = Duration::from_millis(500);

/// Swipe steps used by [`UiObject::swipe`].
pub const DEFAULT_OBJECT_SWIPE_STEPS: u32 = 10;

/// Upper bound on scroll gestures for `to_beginning`/`to_end` flings.
pub const DEFAULT_MAX_SWIPES: u32 = 500;

pub(crate) fn expect_bool(method: &str, value: Value) -> Result<bool, DeviceError> {
    value.as_bool().ok_or_else(|| {
        DeviceError::UnexpectedResponse(format!("{method} returned {value}, expected a boolean"))
    })
}

fn bounds_field(info: &Value, key: &str) -> Option<Bounds> {
    info.get(key).and_then(Bounds::from_json)
}

/// Proxy for the on-screen element(s) matching a selector.
#[derive(Debug, Clone)]
pub struct UiObject {
    device: Device,
    selector: Selector,
}

impl UiObject {
    pub fn new(device: Device, selector: Selector) -> Self {
        Self { device, selector }
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    async fn rpc(&self, method: &str, extra: &[Value]) -> Result<Value, DeviceError> {
        let mut params = vec![self.selector.to_json()];
        params.extend_from_slice(extra);
        self.device.call(method, Value::Array(params)).await
    }

    pub async fn exists(&self) -> Result<bool, DeviceError> {
        expect_bool("exist", self.rpc("exist", &[]).await?)
    }

    /// The agent's description of the first match (`objInfo`).
    pub async fn info(&self) -> Result<Value, DeviceError> {
        self.rpc("objInfo", &[]).await
    }

    /// Waits until the element appears (`exists`) or disappears (`!exists`).
    ///
    /// `timeout` defaults to the configured wait timeout. The transport is
    /// given that timeout plus the configured slack; if it still times out,
    /// the result of a single existence check is returned instead.
    pub async fn wait(&self, exists: bool, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        let config = self.device.config();
        let timeout = timeout.unwrap_or_else(|| config.wait_timeout());
        let method = if exists { "waitForExists" } else { "waitUntilGone" };
        let params = json!([self.selector.to_json(), timeout.as_millis() as u64]);

        match self
            .device
            .call_with_timeout(method, params, timeout + config.wait_slack())
            .await
        {
            Ok(value) => expect_bool(method, value),
            Err(DeviceError::RpcTimeout) => {
                warn!(selector = %self.selector, method, "wait timed out in transport, checking existence once");
                Ok(self.exists().await? == exists)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`wait`](Self::wait), failing with
    /// [`DeviceError::ElementNotFound`] instead of returning `false`.
    pub async fn must_wait(&self, exists: bool, timeout: Option<Duration>) -> Result<(), DeviceError> {
        if self.wait(exists, timeout).await? {
            Ok(())
        } else {
            Err(DeviceError::element_not_found(&self.selector))
        }
    }

    pub async fn wait_gone(&self, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        self.wait(false, timeout).await
    }

    pub async fn get_text(&self, timeout: Option<Duration>) -> Result<Option<String>, DeviceError> {
        self.must_wait(true, timeout).await?;
        let text = self.rpc("getText", &[]).await?;
        Ok(text.as_str().map(str::to_string))
    }

    /// Replaces the element's text. An empty `text` clears the field.
    pub async fn set_text(&self, text: &str, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        self.must_wait(true, timeout).await?;
        if text.is_empty() {
            expect_bool("clearTextField", self.rpc("clearTextField", &[]).await?)
        } else {
            expect_bool("setText", self.rpc("setText", &[json!(text)]).await?)
        }
    }

    pub async fn clear_text(&self, timeout: Option<Duration>) -> Result<bool, DeviceError> {
        self.set_text("", timeout).await
    }

    /// Visible bounds of the first match, falling back to its full bounds.
    pub async fn bounds(&self) -> Result<Bounds, DeviceError> {
        let info = self.info().await?;
        bounds_field(&info, "visibleBounds")
            .or_else(|| bounds_field(&info, "bounds"))
            .ok_or_else(|| DeviceError::UnexpectedResponse("objInfo has no bounds".into()))
    }

    /// Point at a fractional `offset` inside the bounds; the centre by default.
    pub async fn center(&self, offset: Option<(f64, f64)>) -> Result<Point, DeviceError> {
        let (px, py) = offset.unwrap_or((0.5, 0.5));
        Ok(self.bounds().await?.offset(px, py))
    }

    pub async fn click(
        &self,
        timeout: Option<Duration>,
        offset: Option<(f64, f64)>,
    ) -> Result<(), DeviceError> {
        self.must_wait(true, timeout).await?;
        let p = self.center(offset).await?;
        debug!(selector = %self.selector, x = p.x, y = p.y, "click");
        self.device.click(p.x as f64, p.y as f64).await
    }

    /// Clicks if the element shows up within `timeout`. Returns whether it
    /// was clicked.
    pub async fn click_exists(&self, timeout: Duration) -> Result<bool, DeviceError> {
        match self.click(Some(timeout), None).await {
            Ok(()) => Ok(true),
            Err(DeviceError::ElementNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clicks until the element disappears, checking after every `interval`
    /// for at most `retries` rounds. Both default to the configured values.
    /// Returns whether the element is gone.
    pub async fn click_gone(
        &self,
        retries: Option<u32>,
        interval: Option<Duration>,
    ) -> Result<bool, DeviceError> {
        let config = self.device.config();
        let retries = retries.unwrap_or(config.click_gone_retries);
        let interval = interval.unwrap_or_else(|| config.click_gone_interval());

        self.click_exists(Duration::ZERO).await?;
        for _ in 0..retries {
            tokio::time::sleep(interval).await;
            if !self.exists().await? {
                return Ok(true);
            }
            self.click_exists(Duration::ZERO).await?;
        }
        Ok(false)
    }

    pub async fn long_click(
        &self,
        duration: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<(), DeviceError> {
        self.must_wait(true, timeout).await?;
        let p = self.center(None).await?;
        self.device
            .long_click(p.x as f64, p.y as f64, duration.unwrap_or(LONG_CLICK))
            .await
    }

    /// Swipes from the element's centre to its edge in `direction`.
    pub async fn swipe(&self, direction: Direction, steps: u32) -> Result<bool, DeviceError> {
        self.must_wait(true, None).await?;
        let b = self.bounds().await?;
        let c = b.center();
        let to = match direction {
            Direction::Up => (c.x, b.top),
            Direction::Down => (c.x, b.bottom - 1),
            Direction::Left => (b.left, c.y),
            Direction::Right => (b.right - 1, c.y),
        };
        self.device
            .swipe(
                (c.x as f64, c.y as f64),
                (to.0 as f64, to.1 as f64),
                Some(steps),
                None,
            )
            .await
    }

    pub fn child(&self, criteria: Selector) -> UiObject {
        UiObject::new(self.device.clone(), self.selector.clone().child(criteria))
    }

    pub fn sibling(&self, criteria: Selector) -> UiObject {
        UiObject::new(self.device.clone(), self.selector.clone().sibling(criteria))
    }

    /// Nearest element matching `criteria` to the right of this one.
    pub async fn right(&self, criteria: Selector) -> Result<Option<UiObject>, DeviceError> {
        self.beside(Side::Right, criteria).await
    }

    pub async fn left(&self, criteria: Selector) -> Result<Option<UiObject>, DeviceError> {
        self.beside(Side::Left, criteria).await
    }

    pub async fn up(&self, criteria: Selector) -> Result<Option<UiObject>, DeviceError> {
        self.beside(Side::Up, criteria).await
    }

    pub async fn down(&self, criteria: Selector) -> Result<Option<UiObject>, DeviceError> {
        self.beside(Side::Down, criteria).await
    }

    /// Closest candidate on `side` whose projection overlaps this element.
    /// Ties keep the earliest instance.
    async fn beside(&self, side: Side, criteria: Selector) -> Result<Option<UiObject>, DeviceError> {
        let anchor = bounds_field(&self.info().await?, "bounds")
            .ok_or_else(|| DeviceError::UnexpectedResponse("objInfo has no bounds".into()))?;
        let candidates = self.device.select(criteria).instances().await?;

        let mut best: Option<(i32, UiObject)> = None;
        for candidate in &candidates {
            let Some(other) = bounds_field(&candidate.info().await?, "bounds") else {
                continue;
            };
            if let Some(dist) = anchor.distance_to(&other, side) {
                if best.as_ref().map_or(true, |(d, _)| dist < *d) {
                    best = Some((dist, candidate));
                }
            }
        }
        Ok(best.map(|(_, ui)| ui))
    }

    /// Number of elements the selector matches.
    pub async fn count(&self) -> Result<usize, DeviceError> {
        let value = self.rpc("count", &[]).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| DeviceError::UnexpectedResponse(format!("count returned {value}")))
    }

    /// Proxy for the `index`-th match.
    pub fn nth(&self, index: u32) -> UiObject {
        let mut selector = self.selector.clone();
        selector.update_instance(index);
        UiObject::new(self.device.clone(), selector)
    }

    /// Per-instance proxies for the current matches. The count is fetched
    /// now; iterating the result makes no calls and can be repeated.
    pub async fn instances(&self) -> Result<Instances, DeviceError> {
        let count = self.count().await?;
        Ok(Instances {
            base: self.clone(),
            count,
        })
    }

    /// Fling/scroll builder for a scrollable element.
    pub fn fling(&self) -> Fling {
        Fling::new(self.device.clone(), self.selector.clone())
    }
}

/// A fixed-size, restartable sequence of instance proxies.
#[derive(Debug, Clone)]
pub struct Instances {
    base: UiObject,
    count: usize,
}

impl Instances {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<UiObject> {
        (index < self.count).then(|| self.base.nth(index as u32))
    }

    pub fn iter(&self) -> InstanceIter<'_> {
        InstanceIter {
            instances: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a Instances {
    type Item = UiObject;
    type IntoIter = InstanceIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct InstanceIter<'a> {
    instances: &'a Instances,
    next: usize,
}

impl Iterator for InstanceIter<'_> {
    type Item = UiObject;

    fn next(&mut self) -> Option<UiObject> {
        let item = self.instances.get(self.next)?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.instances.count.saturating_sub(self.next);
        (rest, Some(rest))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FlingAction {
    Forward,
    Backward,
    ToBeginning,
    ToEnd,
    To(Selector),
}

/// Fling/scroll gesture on a scrollable element.
///
/// Defaults to a single vertical forward fling.
///
/// ```no_run
/// # use droidwire_core::{device::Device, selector::Selector};
/// # async fn example(device: Device) -> Result<(), droidwire_core::error::DeviceError> {
/// let list = device.select(Selector::new().scrollable(true));
/// list.fling().vertical().to_end().max_swipes(20).perform().await?;
/// list.fling().to(Selector::new().text("About phone")).perform().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Fling {
    device: Device,
    selector: Selector,
    vertical: bool,
    action: FlingAction,
    max_swipes: u32,
}

impl Fling {
    fn new(device: Device, selector: Selector) -> Self {
        Self {
            device,
            selector,
            vertical: true,
            action: FlingAction::Forward,
            max_swipes: DEFAULT_MAX_SWIPES,
        }
    }

    pub fn vertical(mut self) -> Self {
        self.vertical = true;
        self
    }

    pub fn horizontal(mut self) -> Self {
        self.vertical = false;
        self
    }

    pub fn forward(mut self) -> Self {
        self.action = FlingAction::Forward;
        self
    }

    pub fn backward(mut self) -> Self {
        self.action = FlingAction::Backward;
        self
    }

    pub fn to_beginning(mut self) -> Self {
        self.action = FlingAction::ToBeginning;
        self
    }

    pub fn to_end(mut self) -> Self {
        self.action = FlingAction::ToEnd;
        self
    }

    /// Scrolls until an element matching `target` is visible.
    pub fn to(mut self, target: Selector) -> Self {
        self.action = FlingAction::To(target);
        self
    }

    pub fn max_swipes(mut self, n: u32) -> Self {
        self.max_swipes = n;
        self
    }

    /// Runs the gesture. The result is the agent's: whether the list can
    /// still scroll (forward/backward) or whether the target was reached.
    pub async fn perform(self) -> Result<bool, DeviceError> {
        let sel = self.selector.to_json();
        let (method, params) = match &self.action {
            FlingAction::Forward => ("flingForward", json!([sel, self.vertical])),
            FlingAction::Backward => ("flingBackward", json!([sel, self.vertical])),
            FlingAction::ToBeginning => (
                "flingToBeginning",
                json!([sel, self.vertical, self.max_swipes]),
            ),
            FlingAction::ToEnd => ("flingToEnd", json!([sel, self.vertical, self.max_swipes])),
            FlingAction::To(target) => ("scrollTo", json!([sel, target.to_json(), self.vertical])),
        };
        debug!(method, vertical = self.vertical, "fling");
        expect_bool(method, self.device.call(method, params).await?)
    }
}

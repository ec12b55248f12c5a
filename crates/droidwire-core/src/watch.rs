//! Background watcher that dismisses dialogs as they appear.
//!
//! A [`WatchContext`] holds an ordered list of rules, each a set of XPath
//! shorthands plus a callback. While running, a spawned task dumps the
//! hierarchy every interval and walks the rules in registration order. The
//! first rule whose every shorthand matches fires with the element matched
//! by its last shorthand, and the cycle ends there.
//!
//! Stopping is cooperative: a cycle in progress (dump, match, callback) runs
//! to completion, and only the sleep between cycles is interrupted.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use droidwire_core::device::Device;
//!
//! # async fn example(device: Device) -> Result<(), droidwire_core::error::DeviceError> {
//! let mut ctx = device.watch_context(true, Some(Duration::from_secs(1)), false)?;
//! ctx.when("Update later").click()?;
//! ctx.when("%permission%").when("Deny").call(|_device, el| async move {
//!     el.click().await
//! })?;
//!
//! let d = device.clone();
//! ctx.run_scoped(async move {
//!     d.app_start("com.example", None, true, None).await
//! })
//! .await??;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::device::Device;
use crate::error::DeviceError;
use crate::hierarchy::{HierarchySnapshot, XmlElement};
use crate::xpath::compile::compile;
use crate::xpath::selector::match_nodes;

/// Upper bound for the sleep between cycles after repeated dump failures.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Common confirmation and permission dialogs, each dismissed by clicking
/// the last listed match.
const BUILTIN_RULES: &[&[&str]] = &[
    &["继续使用"],
    &["移入管控", "取消"],
    &["^立即(下载|更新)", "取消"],
    &["同意"],
    &["^(好的|确定)"],
    &["继续安装"],
    &["安装"],
    &["Agree"],
    &["ALLOW"],
];

pub type WatchFuture = Pin<Box<dyn Future<Output = Result<(), DeviceError>> + Send>>;

/// Callback fired when a rule matches. Receives the owning device and the
/// element matched by the rule's last shorthand.
pub type WatchCallback = Arc<dyn Fn(Device, XmlElement) -> WatchFuture + Send + Sync>;

/// One registered rule.
#[derive(Clone)]
pub struct WatchRule {
    shorthands: Vec<String>,
    compiled: Vec<String>,
    callback: WatchCallback,
}

impl WatchRule {
    fn new(shorthands: Vec<String>, callback: WatchCallback) -> Self {
        let compiled = shorthands.iter().map(|s| compile(s)).collect();
        Self {
            shorthands,
            compiled,
            callback,
        }
    }

    pub fn shorthands(&self) -> &[String] {
        &self.shorthands
    }

    /// The element matched by the last shorthand, if every shorthand matches.
    fn last_match(
        &self,
        device: &Device,
        snapshot: &Arc<HierarchySnapshot>,
    ) -> Result<Option<XmlElement>, DeviceError> {
        let mut last = None;
        for xpath in &self.compiled {
            let ids = match_nodes(std::slice::from_ref(xpath), snapshot, snapshot.document())?;
            match ids.first() {
                Some(&id) => last = Some(id),
                None => return Ok(None),
            }
        }
        Ok(last.map(|id| XmlElement::new(snapshot.clone(), id, device.clone())))
    }
}

impl std::fmt::Debug for WatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRule")
            .field("shorthands", &self.shorthands)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a [`WatchContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Not polling; can be started.
    Idle,
    /// The polling task is alive.
    Running,
    /// Closed for good.
    Stopped,
}

type SharedRules = Arc<Mutex<Vec<WatchRule>>>;

fn rules_snapshot(rules: &SharedRules) -> Vec<WatchRule> {
    rules
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Sleep before the next cycle: `base`, doubled for each consecutive
/// failure, capped at 30 seconds.
pub(crate) fn backoff_interval(base: Duration, consecutive_errors: u32) -> Duration {
    let multiplier = 1u32.checked_shl(consecutive_errors).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier).min(MAX_BACKOFF)
}

/// Dumps once and returns the first rule that fully matches.
async fn find_match(
    device: &Device,
    rules: &SharedRules,
) -> Result<Option<(WatchRule, XmlElement)>, DeviceError> {
    let xml = device.dump_hierarchy().await?;
    let snapshot = Arc::new(HierarchySnapshot::parse(&xml)?);
    for rule in rules_snapshot(rules) {
        if let Some(element) = rule.last_match(device, &snapshot)? {
            debug!(rule = ?rule.shorthands, element = ?element, "watch rule matched");
            return Ok(Some((rule, element)));
        }
    }
    Ok(None)
}

async fn run_loop(
    device: Device,
    rules: SharedRules,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut consecutive_errors: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let found = find_match(&device, &rules)
            .instrument(debug_span!("watch_cycle"))
            .await;
        match found {
            Ok(Some((rule, element))) => {
                consecutive_errors = 0;
                if let Err(e) = (rule.callback)(device.clone(), element).await {
                    warn!(rule = ?rule.shorthands, error = %e, "watch callback failed");
                }
            }
            Ok(None) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                warn!(error = %e, consecutive_errors, "watch cycle failed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff_interval(interval, consecutive_errors)) => {}
        }
    }
    debug!("watch loop exited");
}

/// An instance-owned set of watch rules with a start/stop lifecycle.
///
/// Dropping the context cancels a running loop without waiting for it.
pub struct WatchContext {
    device: Device,
    interval: Duration,
    rules: SharedRules,
    pending: Vec<String>,
    state: WatchState,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl WatchContext {
    pub fn new(device: Device, interval: Duration) -> Self {
        Self {
            device,
            interval,
            rules: Arc::new(Mutex::new(Vec::new())),
            pending: Vec::new(),
            state: WatchState::Idle,
            cancel: None,
            handle: None,
        }
    }

    /// Registers the built-in dialog rules.
    pub fn with_builtin_rules(&mut self) -> Result<&mut Self, DeviceError> {
        for shorthands in BUILTIN_RULES {
            for shorthand in *shorthands {
                self.when(*shorthand);
            }
            self.click()?;
        }
        Ok(self)
    }

    pub fn state(&self) -> WatchState {
        match self.state {
            WatchState::Running if self.loop_cancelled() => WatchState::Idle,
            state => state,
        }
    }

    /// True when the polling task was cancelled from outside `stop`, e.g. by
    /// dropping a `run_scoped` future.
    fn loop_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Shorthand lists of the registered rules, in evaluation order.
    pub fn rules(&self) -> Vec<Vec<String>> {
        rules_snapshot(&self.rules)
            .into_iter()
            .map(|r| r.shorthands)
            .collect()
    }

    /// Adds a criterion to the rule being built.
    pub fn when(&mut self, shorthand: impl Into<String>) -> &mut Self {
        self.pending.push(shorthand.into());
        self
    }

    /// Commits the pending criteria as one rule firing `callback`.
    ///
    /// Registering the same criteria again replaces the earlier callback and
    /// keeps the rule's position. Rules added while running are picked up on
    /// the next cycle.
    pub fn call<F, Fut>(&mut self, callback: F) -> Result<&mut Self, DeviceError>
    where
        F: Fn(Device, XmlElement) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeviceError>> + Send + 'static,
    {
        if self.pending.is_empty() {
            return Err(DeviceError::EmptyWatchRule);
        }
        let callback: WatchCallback = Arc::new(move |device: Device, element: XmlElement| {
            Box::pin(callback(device, element)) as WatchFuture
        });
        let rule = WatchRule::new(std::mem::take(&mut self.pending), callback);

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        match rules.iter_mut().find(|r| r.shorthands == rule.shorthands) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        drop(rules);
        Ok(self)
    }

    /// Commits the pending criteria as a rule that clicks the match.
    pub fn click(&mut self) -> Result<&mut Self, DeviceError> {
        self.call(|_device, element| async move { element.click().await })
    }

    /// Starts polling. A no-op when already running; fails once closed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        match self.state() {
            WatchState::Stopped => return Err(DeviceError::WatchClosed),
            WatchState::Running => return Ok(()),
            WatchState::Idle => {}
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.device.clone(),
            self.rules.clone(),
            self.interval,
            cancel.clone(),
        ));
        self.cancel = Some(cancel);
        self.handle = Some(handle);
        self.state = WatchState::Running;
        info!(interval = ?self.interval, rules = self.rules().len(), "watch started");
        Ok(())
    }

    /// Stops polling and waits for the current cycle to finish. The context
    /// returns to idle and can be started again.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        if self.state == WatchState::Running {
            self.state = WatchState::Idle;
            info!("watch stopped");
        }
    }

    /// Stops polling for good.
    pub async fn close(&mut self) {
        self.stop().await;
        if self.state != WatchState::Stopped {
            self.state = WatchState::Stopped;
            info!("watch closed");
        }
    }

    /// Runs one cycle inline. Returns whether a rule fired; callback errors
    /// are returned rather than logged.
    pub async fn run_once(&self) -> Result<bool, DeviceError> {
        match find_match(&self.device, &self.rules).await? {
            Some((rule, element)) => {
                (rule.callback)(self.device.clone(), element).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs `body` with the watcher polling in the background and stops it
    /// afterwards, whatever `body` returned.
    ///
    /// Dropping the returned future before `body` finishes cancels the loop
    /// as well; the context is then idle and can be started again.
    pub async fn run_scoped<Fut, T>(&mut self, body: Fut) -> Result<T, DeviceError>
    where
        Fut: Future<Output = T>,
    {
        self.start()?;
        let guard = self.cancel.clone().map(CancellationToken::drop_guard);
        let out = body.await;
        if let Some(guard) = guard {
            let _ = guard.disarm();
        }
        self.stop().await;
        Ok(out)
    }
}

impl std::fmt::Debug for WatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchContext")
            .field("interval", &self.interval)
            .field("state", &self.state)
            .field("rules", &self.rules())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Drop for WatchContext {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

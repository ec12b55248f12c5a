//! Watch loop lifecycle and dispatch tests on a paused clock.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{buttons_dump, device, MockGateway};

use droidwire_core::error::DeviceError;
use droidwire_core::watch::{WatchContext, WatchState};

const INTERVAL: Duration = Duration::from_secs(1);

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// Registers a rule on `ctx` that bumps `hits` when it fires.
fn count_hits(ctx: &mut WatchContext, shorthands: &[&str], hits: &Arc<AtomicUsize>) {
    for s in shorthands {
        ctx.when(*s);
    }
    let hits = hits.clone();
    ctx.call(move |_device, _element| {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_only_matching_rule_fires_once_per_cycle() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let (first, second) = (counter(), counter());
    let mut ctx = WatchContext::new(d, INTERVAL);
    count_hits(&mut ctx, &["Deny"], &first);
    count_hits(&mut ctx, &["Allow"], &second);

    ctx.start().unwrap();
    assert_eq!(ctx.state(), WatchState::Running);
    // cycles at t=0, 1 and 2
    tokio::time::sleep(Duration::from_millis(2500)).await;
    ctx.stop().await;

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 3);
    assert_eq!(mock.dump_count(), 3);
    assert_eq!(ctx.state(), WatchState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_first_matching_rule_wins() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]"), ("Deny", "[0,100][100,200]")]));
    let d = device(&mock);

    let (first, second) = (counter(), counter());
    let mut ctx = WatchContext::new(d, INTERVAL);
    count_hits(&mut ctx, &["Deny"], &first);
    count_hits(&mut ctx, &["Allow"], &second);

    assert!(ctx.run_once().await.unwrap());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_sleep_prevents_next_cycle() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let hits = counter();
    let mut ctx = WatchContext::new(d, INTERVAL);
    count_hits(&mut ctx, &["Allow"], &hits);

    ctx.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    ctx.stop().await;
    assert_eq!(mock.dump_count(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.dump_count(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_and_close_is_terminal() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let hits = counter();
    let mut ctx = WatchContext::new(d, INTERVAL);
    count_hits(&mut ctx, &["Allow"], &hits);

    ctx.start().unwrap();
    // starting twice is a no-op
    ctx.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.stop().await;
    ctx.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.close().await;

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.state(), WatchState::Stopped);
    assert!(matches!(ctx.start(), Err(DeviceError::WatchClosed)));
}

#[tokio::test]
async fn test_call_without_criteria_fails() {
    let mock = MockGateway::new();
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);
    let err = ctx.call(|_d, _e| async { Ok(()) }).unwrap_err();
    assert!(matches!(err, DeviceError::EmptyWatchRule));
    assert!(ctx.rules().is_empty());
}

#[tokio::test]
async fn test_reregistering_replaces_rule_in_place() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("A", "[0,0][100,100]")]));
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);

    let (old, new) = (counter(), counter());
    count_hits(&mut ctx, &["A"], &old);
    ctx.when("B").click().unwrap();
    count_hits(&mut ctx, &["A"], &new);

    assert_eq!(ctx.rules(), vec![vec!["A".to_string()], vec!["B".to_string()]]);
    assert!(ctx.run_once().await.unwrap());
    assert_eq!(old.load(Ordering::SeqCst), 0);
    assert_eq!(new.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_receives_last_xpath_match() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("移入管控", "[0,0][500,100]"), ("取消", "[0,900][500,1000]")]));
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    ctx.when("移入管控").when("取消").call(move |_device, element| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = element.text().map(str::to_string);
            Ok(())
        }
    })
    .unwrap();

    assert!(ctx.run_once().await.unwrap());
    assert_eq!(seen.lock().unwrap().as_deref(), Some("取消"));
}

#[tokio::test]
async fn test_partial_match_does_not_fire() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("移入管控", "[0,0][500,100]")]));
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);

    let hits = counter();
    count_hits(&mut ctx, &["移入管控", "取消"], &hits);
    assert!(!ctx.run_once().await.unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_builtin_rules_click_dialog_buttons() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("ALLOW", "[600,800][900,900]")]));
    let d = device(&mock);

    let ctx = d.watch_context(true, None, false).unwrap();
    assert_eq!(ctx.rules().len(), 9);
    assert_eq!(ctx.interval(), Duration::from_secs(2));
    assert!(ctx.run_once().await.unwrap());
    assert_eq!(mock.calls_to("click"), vec![json!([750, 850])]);
}

#[tokio::test(start_paused = true)]
async fn test_callback_errors_do_not_stop_the_loop() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);

    let hits = counter();
    let h = hits.clone();
    ctx.when("Allow")
        .call(move |_d, _e| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Err(DeviceError::NoMatch("scripted".into()))
            }
        })
        .unwrap();

    ctx.start().unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    ctx.stop().await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // run_once surfaces the same error
    assert!(matches!(ctx.run_once().await, Err(DeviceError::NoMatch(_))));
}

#[tokio::test(start_paused = true)]
async fn test_dump_failures_back_off() {
    let mock = MockGateway::new();
    let mut ctx = WatchContext::new(device(&mock), INTERVAL);
    ctx.when("Allow").click().unwrap();

    ctx.start().unwrap();
    // attempts at t=0, then after 2s and 4s of backoff: t=2, t=6
    tokio::time::sleep(Duration::from_millis(6500)).await;
    ctx.stop().await;
    assert_eq!(mock.dump_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_scoped_stops_after_body() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let hits = counter();
    let mut ctx = d.watch_context(false, Some(INTERVAL), false).unwrap();
    count_hits(&mut ctx, &["Allow"], &hits);

    let out = ctx
        .run_scoped(async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            42
        })
        .await
        .unwrap();
    assert_eq!(out, 42);
    assert_eq!(ctx.state(), WatchState::Idle);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_autostart_and_drop_cancels() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let ctx = d.watch_context(false, Some(INTERVAL), true).unwrap();
    assert_eq!(ctx.state(), WatchState::Running);
    tokio::time::sleep(Duration::from_millis(500)).await;
    drop(ctx);
    let before = mock.dump_count();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.dump_count(), before);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_run_scoped_cancels_loop() {
    let mock = MockGateway::new();
    mock.push_dump(buttons_dump(&[("Allow", "[0,0][100,100]")]));
    let d = device(&mock);

    let hits = counter();
    let mut ctx = d.watch_context(false, Some(INTERVAL), false).unwrap();
    count_hits(&mut ctx, &["Allow"], &hits);

    // the body outlives the timeout, so the scoped future is dropped midway
    let scoped = ctx.run_scoped(tokio::time::sleep(Duration::from_secs(10)));
    assert!(tokio::time::timeout(Duration::from_millis(1500), scoped)
        .await
        .is_err());
    assert_eq!(ctx.state(), WatchState::Idle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(mock.dump_count(), 2);

    // the context can be started again
    ctx.start().unwrap();
    assert_eq!(ctx.state(), WatchState::Running);
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.stop().await;
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

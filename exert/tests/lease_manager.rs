//! Lease expiry callbacks and monitored dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use exert::*;
use exert_testkit::*;
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingListener {
    ended: Mutex<Vec<(Cookie, String, LeaseEnd)>>,
}

impl LeaseListener<String> for RecordingListener {
    fn lease_ended(&self, cookie: Cookie, resource: &String, end: LeaseEnd) {
        self.ended.lock().push((cookie, resource.clone(), end));
    }
}

fn policy(default_ms: u64, max_ms: u64) -> LeasePolicy {
    LeasePolicy {
        default_duration: Duration::from_millis(default_ms),
        max_duration: Duration::from_millis(max_ms),
        heartbeat_timeout: None,
    }
}

fn monitored_dispatcher(monitor: ExertionMonitor, delay: Duration) -> Dispatcher {
    let registry = arithmetic_registry_with(|name| Arithmetic::new(name).with_delay(delay));
    Dispatcher::builder()
        .with_resolver(Arc::new(registry))
        .with_monitor(monitor)
        .with_config(test_config())
        .build()
        .unwrap()
}

fn monitored() -> ControlStrategy {
    ControlStrategy::default().monitored(true)
}

#[test]
fn test_unrenewed_lease_ends_exactly_once() {
    let listener = Arc::new(RecordingListener::default());
    let manager: LeaseManager<String> = LeaseManager::with_listener(policy(1_000, 5_000), listener.clone());
    let lease = manager.new_lease("resource-a".to_string(), None);

    let later = Utc::now() + TimeDelta::seconds(2);
    assert_eq!(manager.sweep_at(later), vec![(lease.cookie, LeaseEnd::Expired)]);
    assert!(manager.sweep_at(later + TimeDelta::seconds(10)).is_empty());

    let ended = listener.ended.lock().clone();
    assert_eq!(ended, vec![(lease.cookie, "resource-a".to_string(), LeaseEnd::Expired)]);
    assert_eq!(
        manager.renew(lease.cookie, Duration::from_secs(1)),
        Err(UnknownLeaseError(lease.cookie))
    );
}

#[test]
fn test_renewal_before_expiration_prevents_callback() {
    let listener = Arc::new(RecordingListener::default());
    let manager: LeaseManager<String> = LeaseManager::with_listener(policy(1_000, 60_000), listener.clone());
    let lease = manager.new_lease("resource-a".to_string(), None);

    let renewed_until = manager.renew(lease.cookie, Duration::from_secs(30)).unwrap();
    assert!(renewed_until > lease.expiration);
    assert!(manager.sweep_at(Utc::now() + TimeDelta::seconds(5)).is_empty());
    assert!(listener.ended.lock().is_empty());
    assert_eq!(manager.get(lease.cookie).unwrap().renewals, 1);
}

#[test]
fn test_requested_duration_is_clamped_to_max() {
    let manager: LeaseManager<String> = LeaseManager::new(policy(1_000, 2_000));
    let before = Utc::now();
    let lease = manager.new_lease("r".to_string(), Some(Duration::from_secs(3_600)));
    assert!(lease.expiration <= before + TimeDelta::milliseconds(2_100));
}

#[test]
fn test_cancel_all_reports_unknown_cookies() {
    let listener = Arc::new(RecordingListener::default());
    let manager: LeaseManager<String> = LeaseManager::with_listener(policy(1_000, 5_000), listener.clone());
    let a = manager.new_lease("a".to_string(), None).cookie;
    let b = manager.new_lease("b".to_string(), None).cookie;
    let unknown = Cookie::new();

    let failures = manager.cancel_all([a, unknown, b]);

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[&unknown], UnknownLeaseError(unknown));
    assert!(manager.is_empty());
    assert_eq!(listener.ended.lock().len(), 2);
}

#[tokio::test]
async fn test_monitored_task_completes_its_lease() {
    let monitor = ExertionMonitor::new(policy(1_000, 5_000));
    let dispatcher = monitored_dispatcher(monitor.clone(), Duration::ZERO);
    let task = arithmetic_task("t1", "Adder", "add", 1.0, 2.0).with_strategy(monitored());
    let id = task.header.id;

    let result = dispatcher.exert(task).await;

    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(monitor.status(id), Some(ExecState::Done));
    assert!(monitor.leases().is_empty());
}

#[tokio::test]
async fn test_long_running_monitored_task_keeps_lease_alive() {
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let monitor = ExertionMonitor::with_events(policy(100, 1_000), events);
    let sweeper_token = CancelToken::new();
    let sweeper = monitor.spawn_sweeper(Duration::from_millis(10), sweeper_token.clone());
    let dispatcher = monitored_dispatcher(monitor.clone(), Duration::from_millis(300));
    let task = arithmetic_task("slow", "Adder", "add", 1.0, 2.0).with_strategy(monitored());
    let id = task.header.id;

    let result = dispatcher.exert(task).await;
    sweeper_token.cancel();
    sweeper.await.unwrap();

    // Outlived its 100 ms lease three times over without being expired.
    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(monitor.status(id), Some(ExecState::Done));
    let mut renewed = false;
    while let Ok(event) = rx.try_recv() {
        match event.payload {
            ExertionEventPayload::LeaseRenewed { .. } => renewed = true,
            ExertionEventPayload::LeaseEnded { .. } => panic!("lease ended during run"),
            _ => {}
        }
    }
    assert!(renewed);
}

#[tokio::test]
async fn test_monitor_cancel_stops_unstarted_children() {
    let monitor = ExertionMonitor::new(policy(5_000, 10_000));
    let dispatcher = monitored_dispatcher(monitor.clone(), Duration::from_millis(100));
    let job = Job::new("j1")
        .with_child(arithmetic_task("t1", "Adder", "add", 1.0, 1.0))
        .with_child(arithmetic_task("t2", "Adder", "add", 1.0, 1.0))
        .with_strategy(monitored());
    let id = job.header.id;

    let handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.exert(job).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    monitor.cancel(id).unwrap();

    let result = handle.await.unwrap();
    assert_eq!(result.state(), ExecState::Failed);
    assert_eq!(monitor.status(id), Some(ExecState::Failed));
    let Exertion::Job(job) = result else {
        panic!("expected a job");
    };
    assert_eq!(job.children[0].state(), ExecState::Done);
    assert_eq!(job.children[1].exceptions()[0].error.kind(), "cancelled");

    assert_eq!(
        monitor.cancel(id),
        Err(MonitorError::UnknownLease(UnknownLeaseError(monitor.cookie(id).unwrap())))
    );
}

#[tokio::test]
async fn test_dropped_dispatch_suspends_then_fails_on_expiry() {
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let monitor = ExertionMonitor::with_events(policy(1_000, 5_000), events);
    let dispatcher = monitored_dispatcher(monitor.clone(), Duration::from_secs(60));
    let task = arithmetic_task("stuck", "Adder", "add", 1.0, 2.0).with_strategy(monitored());
    let id = task.header.id;

    let handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.exert(task).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(monitor.status(id), Some(ExecState::Running));

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(monitor.status(id), Some(ExecState::Suspended));

    // A suspended exertion can be picked up again while its lease lives.
    let session = monitor.resume(id).unwrap();
    assert_eq!(monitor.status(id), Some(ExecState::Running));
    drop(session);
    assert_eq!(monitor.status(id), Some(ExecState::Suspended));

    let ended = monitor.leases().sweep_at(Utc::now() + TimeDelta::seconds(10));
    assert_eq!(ended.len(), 1);
    assert_eq!(monitor.status(id), Some(ExecState::Failed));
    assert!(monitor.resume(id).is_none());

    let mut saw_suspended = false;
    let mut saw_ended = false;
    while let Ok(event) = rx.try_recv() {
        match event.payload {
            ExertionEventPayload::Suspended => saw_suspended = true,
            ExertionEventPayload::LeaseEnded { end, .. } => {
                assert_eq!(end, LeaseEnd::Expired);
                saw_ended = true;
            }
            _ => {}
        }
    }
    assert!(saw_suspended && saw_ended);
}

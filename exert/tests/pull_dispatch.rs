//! Pull dispatch integration tests: publishing to the exertion space,
//! worker pools, timeouts and deferred retrieval.

use std::sync::Arc;
use std::time::Duration;

use exert::*;
use exert_testkit::*;

fn pull_task(name: &str, x1: f64, x2: f64) -> Task {
    arithmetic_task(name, "Adder", "add", x1, x2).with_strategy(ControlStrategy::pull())
}

fn start_pool(space: Arc<dyn ExertionSpace>, parallelism: usize, events: Option<EventBus>) -> WorkerPool {
    let mut builder = WorkerPool::builder()
        .with_config(WorkerConfig::new("adders").for_capability("Adder").with_poll_interval(5))
        .with_parallelism(parallelism)
        .with_space(space)
        .with_resolver(Arc::new(arithmetic_registry()));
    if let Some(events) = events {
        builder = builder.with_events(events);
    }
    let pool = builder.build().unwrap();
    pool.start();
    pool
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pull_task_is_executed_by_a_worker() {
    init_test_tracing();
    let space = Arc::new(CountingSpace::new());
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let pool = start_pool(space.clone(), 1, Some(events.clone()));
    let dispatcher = Dispatcher::builder()
        .with_resolver(Arc::new(ProviderRegistry::new()))
        .with_space(space.clone())
        .with_events(events)
        .with_config(test_config())
        .build()
        .unwrap();

    let result = dispatcher.exert(pull_task("t1", 20.0, 80.0)).await;

    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(result.context().get_f64("result/y").unwrap(), 100.0);
    assert_eq!(space.writes(), 1);
    assert_eq!(space.claims(), 1);
    assert_eq!(space.depth().await.unwrap(), 0);

    let mut published = false;
    let mut claimed_by = None;
    while let Ok(event) = rx.try_recv() {
        match event.payload {
            ExertionEventPayload::Published { capability } => {
                assert_eq!(capability, "Adder");
                published = true;
            }
            ExertionEventPayload::Claimed { worker_id } => claimed_by = Some(worker_id),
            _ => {}
        }
    }
    assert!(published);
    assert_eq!(claimed_by.as_deref(), Some("adders-w0"));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pull_without_space_fails_with_no_space() {
    let dispatcher = dispatcher(arithmetic_registry());

    let result = dispatcher.exert(pull_task("t1", 1.0, 2.0)).await;

    assert_eq!(result.state(), ExecState::Failed);
    assert!(matches!(
        result.exceptions()[0].error,
        ExertError::Dispatch(DispatchError::NoSpace { .. })
    ));
}

#[tokio::test]
async fn test_unclaimed_pull_times_out_and_is_withdrawn() {
    let space = Arc::new(CountingSpace::new());
    let config = EngineConfig {
        dispatch_timeout_ms: 100,
        ..test_config()
    };
    let dispatcher = dispatcher_with(arithmetic_registry(), Some(space.clone()), config);

    let result = dispatcher.exert(pull_task("t1", 1.0, 2.0)).await;

    assert_eq!(result.state(), ExecState::Failed);
    match &result.exceptions()[0].error {
        ExertError::Timeout(timeout) => {
            assert_eq!(timeout.exertion, result.id());
            assert!(!timeout.claimed);
            assert!(timeout.waited >= Duration::from_millis(100));
        }
        other => panic!("expected a dispatch timeout, got {other:?}"),
    }
    assert_eq!(space.withdrawals(), 1);
    assert_eq!(space.depth().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_wait_submission_is_retrieved_later() {
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let dispatcher = dispatcher_with(arithmetic_registry(), Some(space.clone()), test_config());
    let task = arithmetic_task("t1", "Adder", "add", 2.0, 3.0)
        .with_strategy(ControlStrategy::pull().wait(false));

    let submitted = dispatcher.exert(task).await;
    assert_eq!(submitted.state(), ExecState::Running);
    assert!(dispatcher.retrieve(submitted.id()).await.unwrap().is_none());

    let pool = start_pool(space, 1, None);
    let result = dispatcher
        .retrieve_within(submitted.id(), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(result.context().get_f64("result/y").unwrap(), 5.0);
    pool.shutdown().await.unwrap();
}

fn monitored_pull_dispatcher(monitor: ExertionMonitor, space: Arc<dyn ExertionSpace>) -> Dispatcher {
    Dispatcher::builder()
        .with_resolver(Arc::new(ProviderRegistry::new()))
        .with_space(space)
        .with_monitor(monitor)
        .with_config(test_config())
        .build()
        .unwrap()
}

fn lease_policy() -> LeasePolicy {
    LeasePolicy {
        default_duration: Duration::from_secs(1),
        max_duration: Duration::from_secs(5),
        heartbeat_timeout: None,
    }
}

async fn settled(monitor: &ExertionMonitor, id: ExertionId) -> Option<ExecState> {
    for _ in 0..200 {
        match monitor.status(id) {
            Some(state) if state.is_terminal() => return Some(state),
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    monitor.status(id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitored_no_wait_submission_stays_supervised_until_done() {
    init_test_tracing();
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let monitor = ExertionMonitor::new(lease_policy());
    let dispatcher = monitored_pull_dispatcher(monitor.clone(), space.clone());
    let task = arithmetic_task("t1", "Adder", "add", 2.0, 3.0)
        .with_strategy(ControlStrategy::pull().wait(false).monitored(true));

    let submitted = dispatcher.exert(task).await;
    let id = submitted.id();
    assert_eq!(submitted.state(), ExecState::Running);
    assert_eq!(monitor.status(id), Some(ExecState::Running));
    assert_eq!(monitor.leases().len(), 1);

    let pool = start_pool(space, 1, None);
    assert_eq!(settled(&monitor, id).await, Some(ExecState::Done));
    assert!(monitor.leases().is_empty());

    let result = dispatcher.retrieve(id).await.unwrap().expect("result stays in the space");
    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(result.context().get_f64("result/y").unwrap(), 5.0);
    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelling_monitored_no_wait_submission_withdraws_it() {
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let monitor = ExertionMonitor::new(lease_policy());
    let dispatcher = monitored_pull_dispatcher(monitor.clone(), space.clone());
    let task = arithmetic_task("t1", "Adder", "add", 2.0, 3.0)
        .with_strategy(ControlStrategy::pull().wait(false).monitored(true));

    let submitted = dispatcher.exert(task).await;
    let id = submitted.id();
    assert_eq!(space.depth().await.unwrap(), 1);

    monitor.cancel(id).unwrap();

    assert_eq!(settled(&monitor, id).await, Some(ExecState::Failed));
    for _ in 0..200 {
        if space.depth().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(space.depth().await.unwrap(), 0);
    assert!(monitor.leases().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_wait_pull_job_publishes_children_without_waiting() {
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let dispatcher = dispatcher_with(ProviderRegistry::new(), Some(space.clone()), test_config());
    let job = Job::new("fire-and-forget")
        .with_strategy(ControlStrategy::pull().wait(false))
        .with_child(arithmetic_task("t1", "Adder", "add", 1.0, 2.0))
        .with_child(arithmetic_task("t2", "Adder", "add", 3.0, 4.0));

    let started = std::time::Instant::now();
    let submitted = dispatcher.exert(job).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(submitted.state(), ExecState::Running);
    assert_eq!(space.depth().await.unwrap(), 2);
    let Exertion::Job(job) = submitted else {
        panic!("expected a job");
    };
    assert!(job.children.iter().all(|c| c.state() == ExecState::Running));

    let pool = start_pool(space, 2, None);
    let mut sums = Vec::new();
    for child in &job.children {
        let result = dispatcher
            .retrieve_within(child.id(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.state(), ExecState::Done);
        sums.push(result.context().get_f64("result/y").unwrap());
    }
    assert_eq!(sums, vec![3.0, 7.0]);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_no_wait_pull_job_with_mappings_is_rejected() {
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let dispatcher = dispatcher_with(ProviderRegistry::new(), Some(space.clone()), test_config());
    let mut job = Job::new("chain").with_strategy(ControlStrategy::pull().wait(false));
    let t1 = job.add(arithmetic_task("t1", "Adder", "add", 1.0, 2.0));
    let t2 = job.add(arithmetic_task("t2", "Adder", "add", 0.0, 1.0));
    job.map(t1, "result/y", t2, "arg/x1");

    let result = dispatcher.exert(job).await;

    assert_eq!(result.state(), ExecState::Failed);
    match &result.exceptions()[0].error {
        ExertError::Dispatch(DispatchError::InvalidComposition(message)) => {
            assert!(message.contains("cannot carry mappings"), "{message}");
        }
        other => panic!("expected an invalid composition, got {other:?}"),
    }
    assert_eq!(space.depth().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_envelope_is_claimed_exactly_once() {
    let space = Arc::new(CountingSpace::new());
    let pool = start_pool(space.clone(), 4, None);
    let dispatcher = dispatcher_with(arithmetic_registry(), Some(space.clone()), test_config());

    let mut job = Job::new("fan-out").with_strategy(ControlStrategy::par().with_access(AccessType::Pull));
    for i in 0..12 {
        job.add(arithmetic_task(&format!("t{i}"), "Adder", "add", i as f64, 1.0));
    }

    let result = dispatcher.exert(job).await;

    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(space.writes(), 12);
    assert_eq!(space.claims(), 12);
    assert_eq!(space.completes(), 12);
    let Exertion::Job(job) = result else {
        panic!("expected a job");
    };
    for (i, child) in job.children.iter().enumerate() {
        assert_eq!(child.context().get_f64("result/y").unwrap(), i as f64 + 1.0);
    }
    pool.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pull_job_maps_between_pulled_children() {
    let space: Arc<dyn ExertionSpace> = Arc::new(InMemorySpace::new());
    let pool = start_pool(space.clone(), 2, None);
    let dispatcher = dispatcher_with(ProviderRegistry::new(), Some(space), test_config());

    let mut job = Job::new("chain").with_strategy(ControlStrategy::pull());
    let t1 = job.add(arithmetic_task("t1", "Adder", "add", 20.0, 80.0));
    let t2 = job.add(arithmetic_task("t2", "Adder", "add", 0.0, 1.0));
    job.map(t1, "result/y", t2, "arg/x1");

    let result = dispatcher.exert(job).await;

    assert_eq!(result.state(), ExecState::Done);
    assert_eq!(result.context().get_f64("result/y").unwrap(), 101.0);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retrieve_without_space_is_an_error() {
    let dispatcher = dispatcher(arithmetic_registry());
    let err = dispatcher.retrieve(ExertionId::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoSpace { .. }));
}

//! Randomized-delay ordering properties for SEQ and PAR jobs.

use std::sync::Arc;
use std::time::Duration;

use exert::*;
use exert_testkit::*;
use proptest::collection::vec;
use proptest::prelude::*;

/// Children `c0..cn`, each served by its own capability with its own delay,
/// and forward mapping edges between them.
fn build(
    delays: &[u64],
    edges: &[(usize, usize)],
    flow: FlowType,
    log: &InvocationLog,
) -> (Dispatcher, Job) {
    let registry = ProviderRegistry::new();
    let mut job = Job::new("random").with_strategy(ControlStrategy::default().with_flow(flow));
    let mut ids = Vec::new();
    for (i, delay) in delays.iter().enumerate() {
        let capability = format!("C{i}");
        registry.register(
            capability.clone(),
            Arc::new(
                Arithmetic::new(format!("p{i}"))
                    .with_delay(Duration::from_millis(*delay))
                    .with_log(log.clone()),
            ),
        );
        ids.push(job.add(arithmetic_task(&format!("c{i}"), &capability, "add", i as f64, 1.0)));
    }
    for &(from, to) in edges {
        job.map(ids[from], "result/y", ids[to], format!("arg/from{from}"));
    }
    (dispatcher(registry), job)
}

fn forward_edges(n: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    vec((0..n, 0..n), 0..8).prop_map(|pairs| {
        pairs
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.min(b), a.max(b)))
            .collect()
    })
}

fn scenario() -> impl Strategy<Value = (Vec<u64>, Vec<(usize, usize)>)> {
    (2usize..6).prop_flat_map(|n| (vec(0u64..15, n), forward_edges(n)))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime builds")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_par_destination_never_starts_before_sources_finish((delays, edges) in scenario()) {
        let log = InvocationLog::new();
        let (dispatcher, job) = build(&delays, &edges, FlowType::Par, &log);

        let result = runtime().block_on(dispatcher.exert(job));

        prop_assert_eq!(result.state(), ExecState::Done);
        for &(from, to) in &edges {
            let finished = log.position(&format!("c{from}"), Phase::Finished).unwrap();
            let started = log.position(&format!("c{to}"), Phase::Started).unwrap();
            prop_assert!(finished < started, "c{} started before c{} finished", to, from);
        }
    }

    #[test]
    fn test_par_mapped_value_equals_source_result((delays, edges) in scenario()) {
        let log = InvocationLog::new();
        let (dispatcher, job) = build(&delays, &edges, FlowType::Par, &log);

        let Exertion::Job(job) = runtime().block_on(dispatcher.exert(job)) else {
            panic!("expected a job");
        };

        for &(from, to) in &edges {
            let source = job.children[from].context().get_f64("result/y").unwrap();
            let mapped = job.children[to]
                .context()
                .get_f64(&format!("arg/from{from}"))
                .unwrap();
            prop_assert_eq!(source, mapped);
        }
    }

    #[test]
    fn test_seq_runs_in_declaration_order((delays, edges) in scenario()) {
        let log = InvocationLog::new();
        let (dispatcher, job) = build(&delays, &edges, FlowType::Seq, &log);

        let result = runtime().block_on(dispatcher.exert(job));

        prop_assert_eq!(result.state(), ExecState::Done);
        let expected: Vec<String> = (0..delays.len()).map(|i| format!("c{i}")).collect();
        prop_assert_eq!(log.started(), expected);
    }
}

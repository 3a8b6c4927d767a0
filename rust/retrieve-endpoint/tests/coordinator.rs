mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestRegistry, shape};
use retrieve_endpoint::{
    AckKind, Completion, EndpointPlacement, EndpointSender, Interrupt, ProcessRole,
    ResourceScope, ack_channel,
};

const WORKERS: u32 = 3;
const ROWS: usize = 50;
const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn coordinator_collects_every_worker() {
    let registry = TestRegistry::new("coordinator", 16);
    let session = registry.begin_session(42, 5);
    let placement = EndpointPlacement::AllWorkers;
    let (mut collector, link) = ack_channel();

    assert!(!placement.hosts_endpoint(ProcessRole::Coordinator));
    let mut scopes = Vec::new();
    let mut workers = Vec::new();
    for w in (0..WORKERS).filter(|&w| placement.hosts_endpoint(ProcessRole::Worker(w))) {
        let scope = ResourceScope::new(&registry, session);
        let link = Arc::new(link.for_worker(w));
        let worker_scope = scope.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            let mut sender =
                EndpointSender::declare(&worker_scope, &session, "pc", &shape(), link).unwrap();
            for i in 0..ROWS {
                sender
                    .send_row(format!("w{w}-r{i}").as_bytes())
                    .unwrap();
            }
            sender.finish().unwrap()
        }));
        scopes.push(scope);
    }
    drop(link);

    let expected = placement.expected_endpoints(WORKERS);
    assert_eq!(expected, 3);
    let ready = collector.wait_ready(expected, TIMEOUT).await.unwrap();
    let mut seen: Vec<u32> = ready.iter().map(|a| a.worker).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);

    let token = registry
        .session_token(session.session_id, session.user_id)
        .unwrap()
        .to_string();
    let mut retrievals = Vec::new();
    for ack in ready {
        let registry = registry.registry.clone();
        let token = token.clone();
        retrievals.push(tokio::task::spawn_blocking(move || {
            let retriever = registry.authenticate(42, 5, &token).unwrap();
            let mut reader = retriever.attach(&ack.endpoint).unwrap();
            let mut rows = Vec::new();
            while let Some(row) = reader.next_row().unwrap() {
                rows.push(String::from_utf8(row.to_vec()).unwrap());
            }
            (ack.worker, rows)
        }));
    }
    for retrieval in retrievals {
        let (w, rows) = retrieval.await.unwrap();
        let expected: Vec<String> = (0..ROWS).map(|i| format!("w{w}-r{i}")).collect();
        assert_eq!(rows, expected);
    }

    let finished = collector.wait_finished(expected, TIMEOUT).await.unwrap();
    assert!(finished.iter().all(|a| a.kind == AckKind::Finished));
    assert_eq!(registry.endpoints().len(), 3);

    for scope in &scopes {
        scope.close();
    }
    for worker in workers {
        assert_eq!(worker.await.unwrap(), Completion::Closed);
    }
    assert!(registry.endpoints().is_empty());
    assert_eq!(registry.segment_files(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn aborted_worker_still_reports_finished() {
    let registry = TestRegistry::new("coordinator_abort", 4);
    let session = registry.begin_session(42, 5);
    let placement = EndpointPlacement::SingleWorker(1);
    let (mut collector, link) = ack_channel();
    let scope = ResourceScope::new(&registry, session);

    assert!(placement.hosts_endpoint(ProcessRole::Worker(1)));
    assert!(!placement.hosts_endpoint(ProcessRole::Worker(0)));
    let worker_scope = scope.clone();
    let worker = tokio::task::spawn_blocking(move || {
        let sender = EndpointSender::declare(
            &worker_scope,
            &session,
            "pc",
            &shape(),
            Arc::new(link.for_worker(1)),
        )
        .unwrap();
        sender.finish().unwrap()
    });

    let ready = collector
        .wait_ready(placement.expected_endpoints(WORKERS), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(ready[0].worker, 1);

    // Nobody retrieves; the transaction aborts instead.
    scope.abort();
    let finished = collector.wait_finished(1, TIMEOUT).await.unwrap();
    assert_eq!(finished[0].endpoint, ready[0].endpoint);
    assert_eq!(
        worker.await.unwrap(),
        Completion::Aborted(Interrupt::Aborted)
    );
    assert!(registry.endpoints().is_empty());
}

#[tokio::test]
async fn missing_worker_times_out() {
    let (mut collector, link) = ack_channel();
    let placement = EndpointPlacement::Workers(vec![0, 1]);
    assert_eq!(placement.expected_endpoints(WORKERS), 2);

    let _keep = link.for_worker(0);
    assert!(matches!(
        collector
            .wait_ready(placement.expected_endpoints(WORKERS), Duration::from_millis(50))
            .await,
        Err(retrieve_endpoint::EndpointError::Timeout)
    ));
}

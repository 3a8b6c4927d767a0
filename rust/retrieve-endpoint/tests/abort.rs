mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{TestRegistry, eventually, shape};
use retrieve_endpoint::{
    AckKind, Completion, EndpointError, EndpointSender, Interrupt, ResourceScope, SenderPhase,
    ack_channel,
};

#[test]
fn abort_is_idempotent_and_acks_once() {
    let registry = TestRegistry::new("abort_idempotent", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (mut collector, link) = ack_channel();

    let mut sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    sender.send_row(b"a").unwrap();
    assert_eq!(registry.stats().endpoints_in_use, 1);

    sender.abort();
    sender.abort();
    assert_eq!(sender.phase(), SenderPhase::Aborted);
    assert!(registry.endpoints().is_empty());
    assert_eq!(scope.live_states(), 0);
    assert_eq!(registry.segment_files(), 0);

    assert!(matches!(
        sender.send_row(b"b"),
        Err(EndpointError::InvalidPhase {
            actual: SenderPhase::Aborted,
            ..
        })
    ));

    let kinds: Vec<AckKind> = collector.try_collect().iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![AckKind::Ready, AckKind::Finished]);

    drop(sender);
    assert!(collector.try_collect().is_empty());
}

#[test]
fn lost_coordinator_aborts_the_drain_wait() {
    let registry = TestRegistry::new("lost_coordinator", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (collector, link) = ack_channel();

    let mut sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    sender.send_row(b"unread").unwrap();
    let worker = thread::spawn(move || sender.finish().unwrap());

    thread::sleep(Duration::from_millis(50));
    drop(collector);

    assert_eq!(
        worker.join().unwrap(),
        Completion::Aborted(Interrupt::PeerLost)
    );
    assert!(registry.endpoints().is_empty());
    assert_eq!(scope.live_states(), 0);
}

#[test]
fn lost_coordinator_aborts_the_close_wait() {
    let registry = TestRegistry::new("lost_coordinator_close", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (mut collector, link) = ack_channel();

    let mut sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    let name = sender.name().to_owned();
    sender.send_row(b"row").unwrap();
    let worker = thread::spawn(move || sender.finish().unwrap());

    let token = registry.session_token(session.session_id, 7).unwrap();
    let mut reader = registry
        .authenticate(7, 1, &token.to_string())
        .unwrap()
        .attach(&name)
        .unwrap();
    assert_eq!(reader.next_row().unwrap().as_deref(), Some(&b"row"[..]));
    assert_eq!(reader.next_row().unwrap(), None);
    drop(reader);

    eventually("finished ack", || {
        collector
            .try_collect()
            .iter()
            .any(|a| a.kind == AckKind::Finished)
    });
    drop(collector);

    assert_eq!(
        worker.join().unwrap(),
        Completion::Aborted(Interrupt::PeerLost)
    );
    assert!(registry.endpoints().is_empty());
    assert_eq!(registry.segment_files(), 0);
}

#[test]
fn declare_fails_cleanly_without_a_coordinator() {
    let registry = TestRegistry::new("no_coordinator", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (collector, link) = ack_channel();
    drop(collector);

    assert!(matches!(
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)),
        Err(EndpointError::Coordinator(_))
    ));
    assert!(registry.endpoints().is_empty());
    assert_eq!(scope.live_states(), 0);
    assert_eq!(registry.segment_files(), 0);
}

#[test]
fn scope_abort_frees_every_endpoint_and_the_token() {
    let registry = TestRegistry::new("scope_abort", 8);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let child = scope.child();
    let (mut collector, link) = ack_channel();

    let mut first =
        EndpointSender::declare(&scope, &session, "a", &shape(), Arc::new(link.clone())).unwrap();
    let second =
        EndpointSender::declare(&child, &session, "b", &shape(), Arc::new(link.clone())).unwrap();
    first.send_row(b"x").unwrap();

    // Third one blocks in its drain wait.
    let third =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    let worker = thread::spawn(move || third.finish().unwrap());
    thread::sleep(Duration::from_millis(50));

    let token = registry.session_token(session.session_id, 7).unwrap();
    assert_eq!(scope.live_states(), 3);
    assert_eq!(registry.stats().endpoints_in_use, 3);
    assert_eq!(registry.stats().tokens_in_use, 1);

    scope.abort();

    assert_eq!(
        worker.join().unwrap(),
        Completion::Aborted(Interrupt::Aborted)
    );
    assert_eq!(first.phase(), SenderPhase::Aborted);
    assert_eq!(second.phase(), SenderPhase::Aborted);
    assert_eq!(scope.live_states(), 0);
    assert_eq!(child.live_states(), 0);

    let stats = registry.stats();
    assert_eq!(stats.endpoints_in_use, 0);
    assert_eq!(stats.tokens_in_use, 0);
    assert_eq!(registry.segment_files(), 0);
    assert!(matches!(
        registry.authenticate(7, 1, &token.to_string()),
        Err(EndpointError::AuthenticationFailed)
    ));

    let finished = collector
        .try_collect()
        .into_iter()
        .filter(|a| a.kind == AckKind::Finished)
        .count();
    assert_eq!(finished, 3);
}

#[test]
fn token_survives_scope_abort() {
    let registry = TestRegistry::new("token_stable", 4);
    let session = registry.begin_session(7, 1);
    let (_collector, link) = ack_channel();
    let token = registry.session_token(session.session_id, 7).unwrap();

    // Subtransaction abort.
    let scope = ResourceScope::new(&registry, session);
    let child = scope.child();
    let sub =
        EndpointSender::declare(&child, &session, "sub", &shape(), Arc::new(link.clone())).unwrap();
    child.abort();
    assert_eq!(sub.phase(), SenderPhase::Aborted);
    assert_eq!(registry.stats().tokens_in_use, 0);

    let mut first =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link.clone())).unwrap();
    first.send_row(b"x").unwrap();
    assert_eq!(registry.session_token(session.session_id, 7).unwrap(), token);

    // Whole transaction abort, then a new one in the same session.
    scope.abort();
    assert_eq!(first.phase(), SenderPhase::Aborted);
    assert_eq!(registry.stats().tokens_in_use, 0);

    let scope = ResourceScope::new(&registry, session);
    let mut second =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    second.send_row(b"y").unwrap();
    assert_eq!(registry.session_token(session.session_id, 7).unwrap(), token);

    let retriever = registry.authenticate(7, 1, &token.to_string()).unwrap();
    let visible: Vec<String> = retriever.endpoints().into_iter().map(|e| e.name).collect();
    assert_eq!(visible, vec![second.name().to_owned()]);
    let mut reader = retriever.attach(second.name()).unwrap();
    assert_eq!(reader.next_row().unwrap().as_deref(), Some(&b"y"[..]));

    drop(reader);
    second.abort();
}

#[test]
fn dropping_the_scope_aborts_its_senders() {
    let registry = TestRegistry::new("scope_drop", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (_collector, link) = ack_channel();

    let sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    assert_eq!(registry.stats().endpoints_in_use, 1);

    drop(scope);
    assert_eq!(sender.phase(), SenderPhase::Aborted);
    assert!(registry.endpoints().is_empty());
    assert_eq!(registry.stats().tokens_in_use, 0);
}

#[test]
fn dropping_a_sender_mid_stream_frees_its_slot() {
    let registry = TestRegistry::new("sender_drop", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (_collector, link) = ack_channel();

    let mut sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    sender.send_row(b"x").unwrap();
    drop(sender);

    assert!(registry.endpoints().is_empty());
    assert_eq!(scope.live_states(), 0);
    assert_eq!(registry.segment_files(), 0);
}

#[test]
fn shutdown_aborts_a_waiting_sender() {
    let registry = TestRegistry::new("shutdown", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (_collector, link) = ack_channel();

    let sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    let worker = thread::spawn(move || sender.finish().unwrap());
    thread::sleep(Duration::from_millis(50));

    registry.begin_shutdown();
    assert!(registry.stats().shutting_down);
    assert_eq!(
        worker.join().unwrap(),
        Completion::Aborted(Interrupt::Shutdown)
    );
    assert!(registry.endpoints().is_empty());
}

#[test]
fn reader_sees_an_abandoned_queue() {
    let registry = TestRegistry::new("abandoned_queue", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (_collector, link) = ack_channel();

    let mut sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    sender.send_row(b"first").unwrap();

    let token = registry.session_token(session.session_id, 7).unwrap();
    let mut reader = registry
        .authenticate(7, 1, &token.to_string())
        .unwrap()
        .attach(sender.name())
        .unwrap();
    assert_eq!(reader.next_row().unwrap().as_deref(), Some(&b"first"[..]));

    sender.abort();
    assert!(matches!(reader.next_row(), Err(EndpointError::QueueDetached)));
    assert!(!reader.is_finished());

    // The reader still maps the segment until it lets go.
    assert_eq!(registry.segment_files(), 1);
    drop(reader);
    assert_eq!(registry.segment_files(), 0);
    assert!(registry.endpoints().is_empty());
}

#[test]
fn blocked_reader_can_be_interrupted() {
    let registry = TestRegistry::new("reader_interrupt", 4);
    let session = registry.begin_session(7, 1);
    let scope = ResourceScope::new(&registry, session);
    let (_collector, link) = ack_channel();

    let sender =
        EndpointSender::declare(&scope, &session, "c", &shape(), Arc::new(link)).unwrap();
    let token = registry.session_token(session.session_id, 7).unwrap();
    let mut reader = registry
        .authenticate(7, 1, &token.to_string())
        .unwrap()
        .attach(sender.name())
        .unwrap();

    let interrupts = reader.interrupts();
    let blocked = thread::spawn(move || reader.next_row());
    thread::sleep(Duration::from_millis(50));
    interrupts.raise(Interrupt::Aborted);
    assert!(matches!(
        blocked.join().unwrap(),
        Err(EndpointError::Interrupted(Interrupt::Aborted))
    ));

    // The reader is gone; the sender no longer waits for it.
    eventually("receiver to detach", || {
        registry
            .endpoints()
            .first()
            .is_some_and(|info| info.receiver_pid == 0)
    });
    drop(sender);
    assert!(registry.endpoints().is_empty());
}

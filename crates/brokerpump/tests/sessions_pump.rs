// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Session pump integration tests
//!
//! Drives `SessionsMessagePump` end to end over the in-memory link provider.

mod common;

use brokerpump::mock::{MockLink, MockLinkProvider, MockManagement};
use brokerpump::{
    ErrorSource, MessageHandler, Pump, PumpError, ProcessorConfig, ReceiveLink,
    SessionsMessagePump, TerminationCause,
};
use common::{init_tracing, message, wait_until, RecordingHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn config(sessions: usize, calls_per_session: usize) -> ProcessorConfig {
    ProcessorConfig::builder()
        .namespace("orders.broker.example.net")
        .entity_path("orders")
        .max_concurrent_sessions(sessions)
        .max_concurrent_calls_per_session(calls_per_session)
        .build()
        .expect("config")
}

fn pump(
    config: ProcessorConfig,
    provider: &Arc<MockLinkProvider>,
    handler: &Arc<RecordingHandler>,
) -> SessionsMessagePump {
    let handler: Arc<dyn MessageHandler> = handler.clone();
    SessionsMessagePump::new(config, provider.clone(), handler)
}

fn record_terminations() -> (Arc<Mutex<Vec<TerminationCause>>>, brokerpump::OnTerminate) {
    let causes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&causes);
    let callback: brokerpump::OnTerminate = Arc::new(move |cause: &TerminationCause| {
        sink.lock().push(cause.clone());
    });
    (causes, callback)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_termination_closes_each_link_once() {
    init_tracing();
    let provider = MockLinkProvider::new("orders.broker.example.net", "orders");
    let links: Vec<Arc<MockLink>> = ["s1", "s2", "s3"].iter().map(|id| MockLink::session(*id)).collect();
    for link in &links {
        provider.offer_session(link.clone());
    }

    let handler = Arc::new(RecordingHandler::new());
    let (causes, callback) = record_terminations();
    let mut config = config(3, 1);
    config.connection_poll_interval_secs = 1;
    let pump = Arc::new(pump(config, &provider, &handler).on_terminate(callback));

    let handle = Arc::clone(&pump).begin().expect("begin");
    assert!(wait_until(|| pump.active_sessions().len() == 3).await);
    assert_eq!(pump.tracker().len(), 3);

    // Several cancellers racing the health check.
    let mut cancellers = Vec::new();
    for _ in 0..4 {
        let canceller = handle.canceller();
        cancellers.push(tokio::spawn(async move { canceller.cancel() }));
    }
    provider.close_connection();
    for canceller in cancellers {
        canceller.await.expect("canceller task");
    }

    let result = handle.join().await;
    if let Err(err) = &result {
        assert_eq!(err.termination_cause(), Some(&TerminationCause::ConnectionClosed));
    }

    assert!(wait_until(|| links.iter().map(|l| l.close_count()).sum::<usize>() == 3).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    for link in &links {
        assert_eq!(link.close_count(), 1, "{} closed more than once", link.link_name());
    }
    assert_eq!(causes.lock().len(), 1);
    assert!(pump.tracker().is_empty());
    assert!(pump.active_sessions().is_empty());
}

#[tokio::test]
async fn test_single_call_runs_on_pump_task() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("ordered");
    for id in ["m1", "m2", "m3"] {
        link.push(message(id, None));
    }
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(1, 1), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| handler.received_count() == 3).await);
    let test_thread = std::thread::current().id();
    assert!(handler.threads().iter().all(|thread| *thread == test_thread));
    assert_eq!(pump.worker_submissions(), 0);

    let ids: Vec<String> = handler.received().into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    handle.cancel();
    handle.join().await.expect("cancelled pump joins cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_per_session_use_workers() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("parallel");
    for id in ["m1", "m2", "m3", "m4"] {
        link.push(message(id, None));
    }
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(1, 2), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| link.dispositions().len() == 4).await);
    assert_eq!(pump.worker_submissions(), 4);
    assert!(link.dispositions().iter().all(|(_, outcome)| *outcome == "complete"));
    // Initial credits plus one per message.
    assert_eq!(link.credits_granted(), 2 + 4);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test]
async fn test_handler_error_abandons_and_reports() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("s1");
    link.push(message("bad", None));
    link.push(message("good", None));
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    handler.fail_on("bad");
    let pump = Arc::new(pump(config(1, 1), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| link.dispositions().len() == 2).await);
    assert_eq!(
        link.dispositions(),
        vec![
            ("lock-bad".to_string(), "abandon"),
            ("lock-good".to_string(), "complete"),
        ]
    );

    let errors = handler.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorSource::UserCallback);
    assert_eq!(errors[0].1.as_deref(), Some("s1"));
    assert!(errors[0].2.contains("rejected bad"));

    let stats = pump.stats();
    assert_eq!(stats.handler_errors, 1);
    assert_eq!(stats.messages_completed, 1);
    assert_eq!(stats.messages_abandoned, 1);

    handle.cancel();
    handle.join().await.expect("handler errors never fail the pump");
}

#[tokio::test]
async fn test_manual_settlement_suppresses_auto_complete() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("s1");
    link.push(message("poison", None));
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    handler.dead_letter_manually();
    let pump = Arc::new(pump(config(1, 1), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| handler.received_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.dispositions(), vec![("lock-poison".to_string(), "dead-letter")]);
    assert!(handler.errors().is_empty());

    let receiver = pump.tracker().get("s1").expect("session tracked");
    assert_eq!(receiver.held_lock_tokens(), 0);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_rotates_to_next() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let first = MockLink::session("first");
    first.push(message("a1", None));
    let second = MockLink::session("second");
    second.push(message("b1", None));
    provider.offer_session(first.clone());
    provider.offer_session(second.clone());

    let handler = Arc::new(RecordingHandler::new());
    let config = ProcessorConfig::builder()
        .entity_path("orders")
        .session_idle_timeout(Duration::from_secs(5))
        .build()
        .expect("config");
    let pump = Arc::new(pump(config, &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| handler.received_count() == 1).await);
    assert_eq!(pump.active_sessions(), vec!["first".to_string()]);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(wait_until(|| handler.received_count() == 2).await);
    assert_eq!(
        handler.received(),
        vec![
            (Some("first".to_string()), "a1".to_string()),
            (Some("second".to_string()), "b1".to_string()),
        ]
    );
    assert_eq!(first.close_count(), 1);
    assert_eq!(second.close_count(), 0);
    assert_eq!(pump.active_sessions(), vec!["second".to_string()]);
    assert!(pump.tracker().get("first").is_none());
    assert_eq!(pump.stats().sessions_closed, 1);

    handle.cancel();
    handle.join().await.expect("join");
    assert!(wait_until(|| second.close_count() == 1).await);
}

#[tokio::test]
async fn test_acquire_failure_terminates_pump() {
    init_tracing();
    let provider = MockLinkProvider::new("orders.broker.example.net", "orders");
    provider.fail_next_accept(brokerpump::LinkError::Transport("socket reset".into()));

    let handler = Arc::new(RecordingHandler::new());
    let (causes, callback) = record_terminations();
    let pump = Arc::new(pump(config(1, 1), &provider, &handler).on_terminate(callback));
    let handle = Arc::clone(&pump).begin().expect("begin");

    let err = handle.join().await.expect_err("acquire failure is fatal");
    match err {
        PumpError::Terminated {
            namespace,
            entity_path,
            cause,
            ..
        } => {
            assert_eq!(namespace, "orders.broker.example.net");
            assert_eq!(entity_path, "orders");
            assert!(matches!(cause, TerminationCause::AcquireFailed(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handler.error_sources(), vec![ErrorSource::AcceptSession]);
    assert_eq!(causes.lock().len(), 1);
}

#[tokio::test]
async fn test_begin_twice_is_illegal() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(2, 1), &provider, &handler));

    let handle = Arc::clone(&pump).begin().expect("first begin");
    assert!(matches!(
        Arc::clone(&pump).begin(),
        Err(PumpError::IllegalState(_))
    ));

    handle.cancel();
    handle.join().await.expect("join");
    assert!(matches!(
        Arc::clone(&pump).begin(),
        Err(PumpError::IllegalState(_))
    ));
}

#[test]
fn test_begin_outside_runtime_is_illegal() {
    let provider = MockLinkProvider::new("ns", "orders");
    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(1, 1), &provider, &handler));

    assert!(matches!(pump.begin(), Err(PumpError::IllegalState(_))));
}

#[tokio::test(start_paused = true)]
async fn test_connection_health_check_terminates() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("s1");
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    let (causes, callback) = record_terminations();
    let mut config = config(2, 1);
    config.connection_poll_interval_secs = 2;
    let pump = Arc::new(pump(config, &provider, &handler).on_terminate(callback));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| pump.active_sessions().len() == 1).await);
    provider.close_connection();

    let err = handle.join().await.expect_err("closed connection is fatal");
    assert_eq!(err.termination_cause(), Some(&TerminationCause::ConnectionClosed));
    assert_eq!(*causes.lock(), vec![TerminationCause::ConnectionClosed]);
    assert!(wait_until(|| link.close_count() == 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_settlement_routes_to_owning_session() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let left = MockLink::session("left");
    let right = MockLink::session("right");
    left.push(message("l1", None));
    right.push(message("r1", None));
    right.push(message("r2", None));
    provider.offer_session(left.clone());
    provider.offer_session(right.clone());

    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(2, 1), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| left.dispositions().len() == 1 && right.dispositions().len() == 2).await);
    assert_eq!(left.dispositions(), vec![("lock-l1".to_string(), "complete")]);
    assert_eq!(
        right.dispositions(),
        vec![
            ("lock-r1".to_string(), "complete"),
            ("lock-r2".to_string(), "complete"),
        ]
    );
    assert_eq!(pump.stats().sessions_acquired, 2);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn test_session_lock_renewed_while_held() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("renewed");
    provider.offer_session(link.clone());

    let management = Arc::new(MockManagement::new(Duration::from_secs(30)));
    let handler = Arc::new(RecordingHandler::new());
    let config = ProcessorConfig::builder()
        .entity_path("orders")
        .max_auto_lock_renew(Duration::from_secs(300))
        .build()
        .expect("config");
    let pump = Arc::new(pump(config, &provider, &handler).with_management(management.clone()));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| pump.active_sessions().len() == 1).await);
    let receiver = pump.tracker().get("renewed").expect("tracked");
    assert!(receiver.session_locked_until().is_some());

    // 30s validity renews 10s before expiry; give it time for a renewal.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(management.session_renewals() >= 1);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test]
async fn test_messages_without_session_id_are_settled_on_their_session() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("bare");
    link.push_untagged(message("m1", None));
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    let pump = Arc::new(pump(config(1, 1), &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| link.dispositions().len() == 1).await);
    assert_eq!(link.dispositions(), vec![("lock-m1".to_string(), "complete")]);
    assert_eq!(
        handler.received(),
        vec![(Some("bare".to_string()), "m1".to_string())]
    );
    assert!(handler.errors().is_empty());
    assert_eq!(pump.stats().messages_completed, 1);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn test_session_renewal_failure_reported_while_held() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("expiring");
    provider.offer_session(link.clone());

    let management = Arc::new(MockManagement::new(Duration::from_secs(30)));
    management.set_failing(true);
    let handler = Arc::new(RecordingHandler::new());
    let config = ProcessorConfig::builder()
        .entity_path("orders")
        .max_auto_lock_renew(Duration::from_secs(300))
        .session_idle_timeout(Duration::from_secs(60))
        .build()
        .expect("config");
    let pump = Arc::new(pump(config, &provider, &handler).with_management(management.clone()));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| pump.active_sessions().len() == 1).await);

    // First renewal is due 10s before the 30s expiry.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(management.session_renewals() >= 1);
    let errors = handler.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorSource::RenewLock);
    assert_eq!(errors[0].1.as_deref(), Some("expiring"));
    assert_eq!(pump.stats().renewal_failures, 1);
    assert_eq!(pump.active_sessions(), vec!["expiring".to_string()]);

    // The session keeps delivering.
    link.push(message("late", None));
    assert!(wait_until(|| link.dispositions().len() == 1).await);
    assert_eq!(link.dispositions(), vec![("lock-late".to_string(), "complete")]);

    // Releasing the idle session does not report the failure again.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(link.close_count(), 1);
    assert_eq!(pump.stats().sessions_closed, 1);
    assert_eq!(handler.error_sources(), vec![ErrorSource::RenewLock]);
    assert_eq!(pump.stats().renewal_failures, 1);

    handle.cancel();
    handle.join().await.expect("join");
}

#[tokio::test(start_paused = true)]
async fn test_released_session_is_not_active() {
    init_tracing();
    let provider = MockLinkProvider::new("ns", "orders");
    let link = MockLink::session("only");
    link.push(message("m1", None));
    provider.offer_session(link.clone());

    let handler = Arc::new(RecordingHandler::new());
    let config = ProcessorConfig::builder()
        .entity_path("orders")
        .session_idle_timeout(Duration::from_secs(5))
        .build()
        .expect("config");
    let pump = Arc::new(pump(config, &provider, &handler));
    let handle = Arc::clone(&pump).begin().expect("begin");

    assert!(wait_until(|| handler.received_count() == 1).await);
    assert_eq!(pump.active_sessions(), vec!["only".to_string()]);

    // No other session is offered, so the slot stays in acquisition.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(wait_until(|| link.close_count() == 1).await);
    assert!(pump.active_sessions().is_empty());
    assert!(pump.tracker().get("only").is_none());

    handle.cancel();
    handle.join().await.expect("join");
}

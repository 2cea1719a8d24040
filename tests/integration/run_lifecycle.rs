//! Full runs through the orchestrator: phase order, events and results.

use std::time::Duration;

use netgauge::{Error, Event, EventKind, MetricValue, TestPhase};

use crate::fixtures::{Harness, ScriptedServer, WAIT};

fn phase_changes(events: &[Event]) -> Vec<(TestPhase, TestPhase)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::PhaseChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

/// Collect events until one of `kind` arrives.
fn collect_until(sub: &netgauge::Subscription, kind: EventKind) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Some(event) = sub.recv_timeout(WAIT) {
        let done = event.kind() == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("no {} event; saw {:?}", kind, seen);
}

#[test]
fn test_successful_run_walks_every_phase() {
    let (server, release_login) = ScriptedServer::new().with_login_gate();
    let mut h = Harness::new(server);
    let sub = h.bus.subscribe(&[EventKind::PhaseChanged, EventKind::TestCompleted]);

    assert!(h.orchestrator.start_test().unwrap());
    // Login is held open, so the run cannot have moved past preparing.
    assert_eq!(h.lifecycle.state(), TestPhase::Preparing);

    release_login.send(()).unwrap();
    let events = collect_until(&sub, EventKind::TestCompleted);

    assert_eq!(
        phase_changes(&events),
        vec![
            (TestPhase::Idle, TestPhase::Preparing),
            (TestPhase::Preparing, TestPhase::Testing),
            (TestPhase::Testing, TestPhase::Completed),
        ]
    );
    let Some(Event::TestCompleted(record)) = events.last() else {
        panic!("last event should be the completion");
    };
    assert_eq!(record.metric("latency_ms"), Some(&MetricValue::Number(42.0)));
    assert_eq!(record.metric("throughput_mbps"), Some(&MetricValue::Number(87.5)));

    assert_eq!(h.lifecycle.state(), TestPhase::Completed);
    assert_eq!(h.lifecycle.latest_results().as_ref(), Some(record));
    h.worker.stop();
}

#[test]
fn test_second_start_while_running_is_ignored() {
    let (server, release_login) = ScriptedServer::new().with_login_gate();
    let calls = server.log.clone();
    let mut h = Harness::new(server);
    let sub = h.bus.subscribe(&[EventKind::TestCompleted]);

    assert!(h.orchestrator.start_test().unwrap());
    let run = h.orchestrator.current_run();
    assert!(!h.orchestrator.start_test().unwrap());
    assert_eq!(h.orchestrator.current_run(), run);

    release_login.send(()).unwrap();
    assert!(matches!(sub.recv_timeout(WAIT), Some(Event::TestCompleted(_))));
    h.worker.stop();

    let tests = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.as_str() == "test:start")
        .count();
    assert_eq!(tests, 1, "only one test exchange should have run");
}

#[test]
fn test_start_while_results_unread_is_ignored() {
    let mut h = Harness::new(ScriptedServer::new());
    let sub = h.bus.subscribe(&[EventKind::TestCompleted]);

    assert!(h.orchestrator.start_test().unwrap());
    assert!(sub.recv_timeout(WAIT).is_some());
    assert_eq!(h.lifecycle.state(), TestPhase::Completed);

    assert!(!h.orchestrator.start_test().unwrap());
    assert!(h.orchestrator.acknowledge_results());
    assert_eq!(h.lifecycle.state(), TestPhase::Idle);

    // A fresh run is admitted once the results were seen.
    assert!(h.orchestrator.start_test().unwrap());
    assert!(sub.recv_timeout(WAIT).is_some());
    h.worker.stop();
}

#[test]
fn test_invalid_record_returns_to_idle_without_results() {
    let server = ScriptedServer::new().with_records(vec![netgauge::ResultsRecord::invalid(
        "connection reset by peer",
    )]);
    let mut h = Harness::new(server);
    let sub = h.bus.subscribe(&EventKind::ALL);

    h.orchestrator.start_test().unwrap();
    let events = collect_until(&sub, EventKind::TestFailed);

    assert_eq!(
        phase_changes(&events),
        vec![
            (TestPhase::Idle, TestPhase::Preparing),
            (TestPhase::Preparing, TestPhase::Testing),
            (TestPhase::Testing, TestPhase::Idle),
        ]
    );
    assert_eq!(
        events.last(),
        Some(&Event::TestFailed {
            reason: "connection reset by peer".to_string()
        })
    );
    assert!(!events.iter().any(|e| e.kind() == EventKind::TestCompleted));
    assert_eq!(h.lifecycle.state(), TestPhase::Idle);
    assert!(h.lifecycle.latest_results().is_none());
    h.worker.stop();
}

#[test]
fn test_exchange_error_becomes_failed_run() {
    let mut h = Harness::new(ScriptedServer::new().failing_tests());
    let sub = h.bus.subscribe(&[EventKind::TestFailed]);

    h.orchestrator.start_test().unwrap();
    match sub.recv_timeout(WAIT) {
        Some(Event::TestFailed { reason }) => {
            assert!(reason.starts_with("test exchange failed"), "{}", reason)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(h.lifecycle.state(), TestPhase::Idle);
    h.worker.stop();
}

#[test]
fn test_rejected_login_goes_back_to_idle() {
    let server = ScriptedServer::new().rejecting_login();
    let calls = server.log.clone();
    let mut h = Harness::new(server);
    let sub = h.bus.subscribe(&EventKind::ALL);

    h.orchestrator.start_test().unwrap();
    let events = collect_until(&sub, EventKind::TestFailed);
    h.worker.stop();

    // The run never reached testing.
    assert_eq!(
        phase_changes(&events),
        vec![
            (TestPhase::Idle, TestPhase::Preparing),
            (TestPhase::Preparing, TestPhase::Idle),
        ]
    );
    match events.last() {
        Some(Event::TestFailed { reason }) => {
            assert!(reason.contains("invalid router token"), "{}", reason)
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!calls.lock().unwrap().iter().any(|c| c.starts_with("test:")));
    assert_eq!(h.lifecycle.state(), TestPhase::Idle);
}

#[test]
fn test_completed_run_is_reported() {
    let mut h = Harness::new(ScriptedServer::new());
    let sub = h.bus.subscribe(&[EventKind::ReportRouter]);

    h.orchestrator.start_test().unwrap();
    match sub.recv_timeout(WAIT) {
        Some(Event::ReportRouter(receipt)) => {
            assert_eq!((receipt.set_id, receipt.result_id), (11, 12));
        }
        other => panic!("expected report receipt, got {:?}", other),
    }
    h.worker.stop();
}

#[test]
fn test_acknowledge_only_from_completed() {
    let mut h = Harness::new(ScriptedServer::new().with_login_delay(Duration::from_millis(50)));
    assert!(!h.orchestrator.acknowledge_results());

    let sub = h.bus.subscribe(&[EventKind::TestCompleted, EventKind::PhaseChanged]);
    h.orchestrator.start_test().unwrap();
    assert!(!h.orchestrator.acknowledge_results(), "run still in flight");

    collect_until(&sub, EventKind::TestCompleted);
    sub.drain();
    assert!(h.orchestrator.acknowledge_results());
    assert_eq!(
        sub.recv_timeout(WAIT),
        Some(Event::PhaseChanged {
            from: TestPhase::Completed,
            to: TestPhase::Idle
        })
    );
    h.worker.stop();
}

#[test]
fn test_start_after_worker_stopped() {
    let mut h = Harness::new(ScriptedServer::new());
    h.worker.stop();

    assert!(matches!(h.orchestrator.start_test(), Err(Error::WorkerStopped)));
    assert_eq!(h.lifecycle.state(), TestPhase::Idle);
    assert!(h.orchestrator.current_run().is_none());
}

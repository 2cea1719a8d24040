//! Drives one test run end to end.
//!
//! `start_test` claims the lifecycle, enqueues LOGIN then REQUEST_TEST on the
//! bound worker and returns immediately. Replies arrive on the worker thread
//! through a callback [`ReplyTarget`] and advance the lifecycle from there.
//! Every phase change is published on the [`EventBus`].

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comm::{CommHandle, ReplyTarget, WorkerReply};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::lifecycle::{TestLifecycleState, TestPhase};
use crate::results::ResultsRecord;
use crate::{nlog, nlog_debug, nlog_error, nlog_warn};

/// Identifies one run so late replies from an earlier run can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Inner {
    lifecycle: Arc<TestLifecycleState>,
    bus: Arc<EventBus>,
    comm: Mutex<Option<CommHandle>>,
    current_run: Mutex<Option<RunId>>,
}

/// Sequences login, test execution and reporting for each run.
///
/// Cheap to clone; clones share the same lifecycle, bus and binding.
#[derive(Clone)]
pub struct TestOrchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TestOrchestrator {
    pub fn new(lifecycle: Arc<TestLifecycleState>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lifecycle,
                bus,
                comm: Mutex::new(None),
                current_run: Mutex::new(None),
            }),
        }
    }

    /// Bind (or rebind) the worker used by subsequent runs.
    pub fn set_communicator(&self, comm: CommHandle) {
        nlog_debug!("Orchestrator: communicator bound");
        *lock(&self.inner.comm) = Some(comm);
    }

    pub fn lifecycle(&self) -> &Arc<TestLifecycleState> {
        &self.inner.lifecycle
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn current_run(&self) -> Option<RunId> {
        *lock(&self.inner.current_run)
    }

    /// Start a run if the lifecycle is idle.
    ///
    /// Returns `Ok(false)` without side effects when a run is active or an
    /// unread record is pending. Errors if no worker is bound, or if the
    /// bound worker has stopped (the claimed phase is released first).
    pub fn start_test(&self) -> Result<bool> {
        let comm = lock(&self.inner.comm)
            .clone()
            .ok_or(Error::CommunicatorNotBound)?;

        if !self.inner.lifecycle.begin_run() {
            nlog_debug!(
                "Orchestrator: start_test ignored in phase {}",
                self.inner.lifecycle.state()
            );
            return Ok(false);
        }

        let run = RunId::new();
        *lock(&self.inner.current_run) = Some(run);
        nlog!("Run {} started", run.short());
        self.publish_phase(TestPhase::Idle, TestPhase::Preparing);

        let this = self.clone();
        let reply_to = ReplyTarget::callback(move |reply| this.on_reply(run, reply));

        if let Err(e) = comm
            .try_login()
            .and_then(|()| comm.try_request_test(reply_to))
        {
            nlog_error!("Run {} could not reach the worker: {}", run.short(), e);
            *lock(&self.inner.current_run) = None;
            if let Ok(from) = self.inner.lifecycle.abort() {
                self.publish_phase(from, TestPhase::Idle);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// The presentation layer dismissed the results: `Completed -> Idle`.
    pub fn acknowledge_results(&self) -> bool {
        match self.inner.lifecycle.acknowledge() {
            Ok(()) => {
                self.publish_phase(TestPhase::Completed, TestPhase::Idle);
                true
            }
            Err(e) => {
                nlog_debug!("Orchestrator: acknowledge ignored: {}", e);
                false
            }
        }
    }

    fn is_current(&self, run: RunId) -> bool {
        *lock(&self.inner.current_run) == Some(run)
    }

    fn on_reply(&self, run: RunId, reply: WorkerReply) {
        match reply {
            WorkerReply::Reported(receipt) => {
                nlog!(
                    "Run {} reported as set {} result {}",
                    run.short(),
                    receipt.set_id,
                    receipt.result_id
                );
                self.inner.bus.publish(Event::ReportRouter(receipt));
            }
            WorkerReply::ReportFailed(reason) => {
                nlog_warn!("Run {} report failed: {}", run.short(), reason);
            }
            _ if !self.is_current(run) => {
                nlog_debug!("Orchestrator: ignoring stale reply for run {}", run.short());
            }
            WorkerReply::TestStarted => match self.inner.lifecycle.transition(TestPhase::Testing) {
                Ok(from) => self.publish_phase(from, TestPhase::Testing),
                Err(e) => nlog_warn!("Run {}: {}", run.short(), e),
            },
            WorkerReply::TestFinished(record) => self.finish(run, record),
        }
    }

    fn finish(&self, run: RunId, record: ResultsRecord) {
        if record.is_valid() {
            match self.inner.lifecycle.complete(record.clone()) {
                Ok(()) => {
                    nlog!("Run {} completed ({})", run.short(), record.id().short());
                    self.publish_phase(TestPhase::Testing, TestPhase::Completed);
                    self.inner.bus.publish(Event::TestCompleted(record.clone()));
                    self.report(run, record);
                }
                Err(e) => nlog_warn!("Run {}: could not complete: {}", run.short(), e),
            }
            return;
        }

        let reason = record.failure().unwrap_or("unknown failure").to_string();
        nlog_warn!("Run {} failed: {}", run.short(), reason);
        *lock(&self.inner.current_run) = None;
        match self.inner.lifecycle.abort() {
            Ok(from) => self.publish_phase(from, TestPhase::Idle),
            Err(e) => nlog_warn!("Run {}: {}", run.short(), e),
        }
        self.inner.bus.publish(Event::TestFailed { reason });
    }

    fn report(&self, run: RunId, record: ResultsRecord) {
        let Some(comm) = lock(&self.inner.comm).clone() else {
            return;
        };
        let this = self.clone();
        let reply_to = ReplyTarget::callback(move |reply| this.on_reply(run, reply));
        if let Err(e) = comm.try_report(record, Some(reply_to)) {
            nlog_warn!("Run {}: results not uploaded: {}", run.short(), e);
        }
    }

    fn publish_phase(&self, from: TestPhase, to: TestPhase) {
        self.inner.bus.publish(Event::PhaseChanged { from, to });
    }
}

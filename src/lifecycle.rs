//! Test lifecycle state machine.
//!
//! A single `TestLifecycleState` is constructed at process start and shared
//! (behind an `Arc`) with every component that needs it. Every mutation runs
//! under one mutex so phase transitions from the caller's thread and the
//! worker-callback thread cannot interleave.
//!
//! ```text
//! Idle -> Preparing -> Testing -> Completed -> Idle
//!            |            |
//!            +-> Idle     +-> Idle      (invalid record, run aborted)
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nlog_debug;
use crate::results::ResultsRecord;

const MAX_HISTORY: usize = 32;

/// Phase of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    /// No run active, no unread record pending
    #[default]
    Idle,
    /// Login/setup in flight
    Preparing,
    /// Test exchange in flight
    Testing,
    /// A validated record is available and unread
    Completed,
}

impl TestPhase {
    /// Whether a run is occupying the pipeline.
    pub fn is_busy(&self) -> bool {
        !matches!(self, TestPhase::Idle)
    }
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestPhase::Idle => write!(f, "idle"),
            TestPhase::Preparing => write!(f, "preparing"),
            TestPhase::Testing => write!(f, "testing"),
            TestPhase::Completed => write!(f, "completed"),
        }
    }
}

/// Check a transition against the table.
///
/// `Preparing -> Idle` covers a run whose login failed: the invalid record
/// arrives before the test exchange ever started.
pub fn can_transition(from: TestPhase, to: TestPhase) -> bool {
    matches!(
        (from, to),
        (TestPhase::Idle, TestPhase::Preparing)
            | (TestPhase::Preparing, TestPhase::Testing)
            | (TestPhase::Preparing, TestPhase::Idle)
            | (TestPhase::Testing, TestPhase::Completed)
            | (TestPhase::Testing, TestPhase::Idle)
            | (TestPhase::Completed, TestPhase::Idle)
    )
}

/// A record of a phase transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: TestPhase,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    phase: TestPhase,
    latest: Option<ResultsRecord>,
    history: VecDeque<PhaseHistoryEntry>,
}

impl Inner {
    fn enter(&mut self, phase: TestPhase) {
        self.phase = phase;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(PhaseHistoryEntry {
            phase,
            entered_at: Utc::now(),
        });
    }

    fn checked_enter(&mut self, target: TestPhase) -> Result<TestPhase> {
        let from = self.phase;
        if !can_transition(from, target) {
            nlog_debug!("Lifecycle: rejected {} -> {}", from, target);
            return Err(Error::InvalidPhaseTransition {
                from: from.to_string(),
                to: target.to_string(),
            });
        }
        self.enter(target);
        nlog_debug!("Lifecycle: {} -> {}", from, target);
        Ok(from)
    }
}

/// Process-wide phase tracker plus the most recent results record.
#[derive(Debug)]
pub struct TestLifecycleState {
    inner: Mutex<Inner>,
}

impl Default for TestLifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLifecycleState {
    pub fn new() -> Self {
        let mut inner = Inner {
            phase: TestPhase::Idle,
            latest: None,
            history: VecDeque::with_capacity(MAX_HISTORY),
        };
        inner.enter(TestPhase::Idle);
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave Inner half-written:
        // every mutation is a single assignment after validation.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current phase.
    pub fn state(&self) -> TestPhase {
        self.lock().phase
    }

    /// The most recent validated record, if any.
    pub fn latest_results(&self) -> Option<ResultsRecord> {
        self.lock().latest.clone()
    }

    /// Move to `target` if the table allows it. Returns the previous phase.
    pub fn transition(&self, target: TestPhase) -> Result<TestPhase> {
        self.lock().checked_enter(target)
    }

    /// Atomically claim the pipeline: `Idle -> Preparing`.
    ///
    /// Returns false (and changes nothing) when a run is already active or
    /// an unread record is pending.
    pub fn begin_run(&self) -> bool {
        let mut inner = self.lock();
        if inner.phase != TestPhase::Idle {
            nlog_debug!("Lifecycle: begin_run ignored in phase {}", inner.phase);
            return false;
        }
        inner.enter(TestPhase::Preparing);
        nlog_debug!("Lifecycle: idle -> preparing");
        true
    }

    /// `Testing -> Completed`, storing `record` in the same critical section.
    pub fn complete(&self, record: ResultsRecord) -> Result<()> {
        if !record.is_valid() {
            return Err(Error::InvalidRecord(
                "cannot complete a run with an invalid record".to_string(),
            ));
        }
        let mut inner = self.lock();
        inner.checked_enter(TestPhase::Completed)?;
        inner.latest = Some(record);
        Ok(())
    }

    /// Abort the in-flight run back to `Idle`. Returns the phase it left.
    pub fn abort(&self) -> Result<TestPhase> {
        let mut inner = self.lock();
        match inner.phase {
            TestPhase::Preparing | TestPhase::Testing => inner.checked_enter(TestPhase::Idle),
            other => Err(Error::InvalidPhaseTransition {
                from: other.to_string(),
                to: TestPhase::Idle.to_string(),
            }),
        }
    }

    /// The user has seen the results: `Completed -> Idle`.
    ///
    /// The record stays readable until the next run supersedes it.
    pub fn acknowledge(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != TestPhase::Completed {
            return Err(Error::InvalidPhaseTransition {
                from: inner.phase.to_string(),
                to: TestPhase::Idle.to_string(),
            });
        }
        inner.checked_enter(TestPhase::Idle).map(|_| ())
    }

    /// Drop the stored record.
    pub fn clear_results(&self) {
        self.lock().latest = None;
    }

    /// Phases visited, oldest first (bounded).
    pub fn history(&self) -> Vec<PhaseHistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }
}

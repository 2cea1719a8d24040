//! In-process publish/subscribe bus.
//!
//! The orchestrator publishes run events here instead of calling into the
//! presentation layer directly. Observers hold a [`Subscription`] for the
//! period they can react and hand it back through [`EventBus::unsubscribe`].
//! Delivery is best-effort: events published while nobody listens are
//! dropped, not queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::comm::ReportReceipt;
use crate::lifecycle::TestPhase;
use crate::nlog_debug;
use crate::results::ResultsRecord;

/// Named event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A run finished with a valid record.
    TestCompleted,
    /// A run was aborted; the payload carries no metrics.
    TestFailed,
    /// The lifecycle phase changed.
    PhaseChanged,
    /// The server acknowledged uploaded results.
    ReportRouter,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::TestCompleted,
        EventKind::TestFailed,
        EventKind::PhaseChanged,
        EventKind::ReportRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TestCompleted => "TestCompleted",
            EventKind::TestFailed => "TestFailed",
            EventKind::PhaseChanged => "PhaseChanged",
            EventKind::ReportRouter => "ReportRouter",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TestCompleted(ResultsRecord),
    TestFailed { reason: String },
    PhaseChanged { from: TestPhase, to: TestPhase },
    ReportRouter(ReportReceipt),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TestCompleted(_) => EventKind::TestCompleted,
            Event::TestFailed { .. } => EventKind::TestFailed,
            Event::PhaseChanged { .. } => EventKind::PhaseChanged,
            Event::ReportRouter(_) => EventKind::ReportRouter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A registered interest in one or more event kinds.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    kinds: Vec<EventKind>,
    rx: Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain everything delivered so far.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: Sender<Event>,
}

/// Topic-based broadcast: event kind -> subscribers.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<EventKind, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Subscriber>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register for `kinds`. Events arrive in publish order.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut kinds = kinds.to_vec();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();

        let mut topics = self.topics();
        for kind in &kinds {
            topics.entry(*kind).or_default().push(Subscriber {
                id,
                tx: tx.clone(),
            });
        }
        nlog_debug!("EventBus: subscriber {} registered for {:?}", id.0, kinds);

        Subscription { id, kinds, rx }
    }

    /// Release a subscription. Events published afterwards are not delivered.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut topics = self.topics();
        for kind in &subscription.kinds {
            if let Some(subs) = topics.get_mut(kind) {
                subs.retain(|s| s.id != subscription.id);
            }
        }
        nlog_debug!("EventBus: subscriber {} released", subscription.id.0);
    }

    /// Deliver `event` to every current subscriber of its kind.
    ///
    /// Returns how many subscribers received it. Subscribers whose
    /// `Subscription` was dropped without unsubscribing are pruned here.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let mut topics = self.topics();
        let Some(subs) = topics.get_mut(&kind) else {
            nlog_debug!("EventBus: {} dropped, no subscribers", kind);
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|s| {
            if s.tx.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        nlog_debug!("EventBus: {} delivered to {} subscribers", kind, delivered);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let topics = self.topics();
        let mut ids: Vec<u64> = topics.values().flatten().map(|s| s.id.0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

//! Communication subsystem.
//!
//! A [`CommunicationWorker`] owns the only connection to the remote server
//! and runs on a dedicated thread. Everything else talks to it by enqueuing
//! [`CommMessage`]s through a cloneable [`CommHandle`]; the queue is strictly
//! FIFO, so a login enqueued before a test request always completes first.
//! Results come back asynchronously through a caller-supplied [`ReplyTarget`].

mod probe;
mod server;
mod tcp;
mod worker;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::results::ResultsRecord;

pub use probe::run_probe;
pub use server::{Credentials, RemoteServer, SessionToken, TestSettings};
pub use tcp::TcpServer;
pub use worker::{CommHandle, CommunicationWorker, SessionStatus, DEFAULT_CALL_TIMEOUT};

/// Server acknowledgement for uploaded results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReceipt {
    pub set_id: i64,
    pub result_id: i64,
}

/// Asynchronous answers the worker sends to a [`ReplyTarget`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// The session is established and the test exchange is starting.
    TestStarted,
    /// The test exchange ended. Network failures arrive as an invalid record.
    TestFinished(ResultsRecord),
    Reported(ReportReceipt),
    ReportFailed(String),
}

type ReplyFn = dyn Fn(WorkerReply) + Send + Sync;

#[derive(Clone)]
enum ReplyInner {
    Channel(Sender<WorkerReply>),
    Callback(Arc<ReplyFn>),
}

/// Where the worker delivers replies for a request.
///
/// Either a channel (the requester drains it on its own thread) or a
/// callback invoked on the worker thread. Dropping the receiving end of a
/// channel target invalidates it; late replies are then discarded.
#[derive(Clone)]
pub struct ReplyTarget {
    inner: ReplyInner,
}

impl ReplyTarget {
    /// A channel-backed target and the receiver that will see its replies.
    pub fn channel() -> (Self, Receiver<WorkerReply>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: Sender<WorkerReply>) -> Self {
        Self {
            inner: ReplyInner::Channel(tx),
        }
    }

    /// A target that runs `f` on the worker thread for every reply.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(WorkerReply) + Send + Sync + 'static,
    {
        Self {
            inner: ReplyInner::Callback(Arc::new(f)),
        }
    }

    /// Returns false when the target no longer accepts replies.
    pub(crate) fn deliver(&self, reply: WorkerReply) -> bool {
        match &self.inner {
            ReplyInner::Channel(tx) => tx.send(reply).is_ok(),
            ReplyInner::Callback(f) => {
                f(reply);
                true
            }
        }
    }
}

impl std::fmt::Debug for ReplyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            ReplyInner::Channel(_) => f.write_str("ReplyTarget::Channel"),
            ReplyInner::Callback(_) => f.write_str("ReplyTarget::Callback"),
        }
    }
}

/// Unit of work on the worker's queue.
#[derive(Debug)]
pub enum CommMessage {
    /// Authenticate; `None` uses the worker's configured credentials.
    Login { credentials: Option<Credentials> },
    RequestTest { reply_to: ReplyTarget },
    /// Upload a valid record's metrics to the server.
    Report {
        record: ResultsRecord,
        reply_to: Option<ReplyTarget>,
    },
    Quit,
}

impl CommMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            CommMessage::Login { .. } => "LOGIN",
            CommMessage::RequestTest { .. } => "REQUEST_TEST",
            CommMessage::Report { .. } => "REPORT",
            CommMessage::Quit => "QUIT",
        }
    }
}

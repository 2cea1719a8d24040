//! The background communication worker.
//!
//! One OS thread per worker, driving a current-thread tokio runtime over an
//! unbounded FIFO queue. Only this thread performs network I/O.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Builder;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::results::ResultsRecord;
use crate::util::with_timeout;
use crate::{nlog, nlog_debug, nlog_error, nlog_warn};

use super::{CommMessage, Credentials, RemoteServer, ReplyTarget, SessionToken, WorkerReply};

/// Upper bound on a single server call, probes included.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

const THREAD_NAME: &str = "comm-worker";

/// Session as seen by the worker after its latest LOGIN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    LoggedOut,
    Active(SessionToken),
    Failed(String),
}

/// Cloneable enqueue side of a running worker.
#[derive(Debug, Clone)]
pub struct CommHandle {
    tx: mpsc::UnboundedSender<CommMessage>,
}

impl CommHandle {
    fn enqueue(&self, msg: CommMessage) -> Result<()> {
        let kind = msg.kind();
        self.tx.send(msg).map_err(|_| {
            nlog_error!("Enqueue {} on a stopped communication worker", kind);
            Error::WorkerStopped
        })?;
        nlog_debug!("CommHandle: enqueued {}", kind);
        Ok(())
    }

    /// Enqueue a LOGIN with the worker's configured credentials.
    ///
    /// # Panics
    ///
    /// If the worker is not running.
    pub fn login(&self) {
        if let Err(e) = self.try_login() {
            panic!("login(): {}", e);
        }
    }

    /// Enqueue a REQUEST_TEST whose replies go to `reply_to`.
    ///
    /// # Panics
    ///
    /// If the worker is not running.
    pub fn request_test(&self, reply_to: ReplyTarget) {
        if let Err(e) = self.try_request_test(reply_to) {
            panic!("request_test(): {}", e);
        }
    }

    pub fn try_login(&self) -> Result<()> {
        self.enqueue(CommMessage::Login { credentials: None })
    }

    pub fn try_login_with(&self, credentials: Credentials) -> Result<()> {
        self.enqueue(CommMessage::Login {
            credentials: Some(credentials),
        })
    }

    pub fn try_request_test(&self, reply_to: ReplyTarget) -> Result<()> {
        self.enqueue(CommMessage::RequestTest { reply_to })
    }

    pub fn try_report(&self, record: ResultsRecord, reply_to: Option<ReplyTarget>) -> Result<()> {
        self.enqueue(CommMessage::Report { record, reply_to })
    }

    /// Whether the worker thread still accepts messages.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Running {
    handle: CommHandle,
    join: JoinHandle<()>,
}

/// Owner of the single server connection.
///
/// Construct once, `start()` to spawn the thread, `stop()` to drain and
/// join it. Dropping a running worker stops it.
pub struct CommunicationWorker<S> {
    server: Option<S>,
    credentials: Credentials,
    call_timeout: Duration,
    session: Arc<RwLock<SessionStatus>>,
    running: Option<Running>,
}

impl<S> CommunicationWorker<S>
where
    S: RemoteServer + Send + 'static,
{
    pub fn new(server: S, credentials: Credentials) -> Self {
        Self {
            server: Some(server),
            credentials,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            session: Arc::new(RwLock::new(SessionStatus::LoggedOut)),
            running: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Spawn the worker thread. A worker runs at most once.
    pub fn start(&mut self) -> Result<CommHandle> {
        let server = self.server.take().ok_or(Error::WorkerAlreadyStarted)?;

        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            credentials: self.credentials.clone(),
            call_timeout: self.call_timeout,
            session: self.session.clone(),
        };

        let join = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(run_loop(server, rx, ctx)))?;

        let handle = CommHandle { tx };
        nlog!("Communication worker started");
        self.running = Some(Running {
            handle: handle.clone(),
            join,
        });
        Ok(handle)
    }

    /// Enqueue QUIT and block until the queue is drained and the thread exits.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            nlog_debug!("CommunicationWorker::stop on a worker that is not running");
            return;
        };
        // The thread may already be gone if it panicked; join reports that.
        let _ = running.handle.tx.send(CommMessage::Quit);
        if running.join.join().is_err() {
            nlog_error!("Communication worker thread panicked");
        }
        nlog!("Communication worker stopped");
    }

    pub fn handle(&self) -> Option<CommHandle> {
        self.running.as_ref().map(|r| r.handle.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn session(&self) -> SessionStatus {
        read_session(&self.session)
    }
}

impl<S> Drop for CommunicationWorker<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.handle.tx.send(CommMessage::Quit);
            let _ = running.join.join();
        }
    }
}

struct WorkerContext {
    credentials: Credentials,
    call_timeout: Duration,
    session: Arc<RwLock<SessionStatus>>,
}

fn read_session(session: &RwLock<SessionStatus>) -> SessionStatus {
    session
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write_session(session: &RwLock<SessionStatus>, status: SessionStatus) {
    *session
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
}

async fn run_loop<S: RemoteServer>(
    mut server: S,
    mut rx: mpsc::UnboundedReceiver<CommMessage>,
    ctx: WorkerContext,
) {
    while let Some(msg) = rx.recv().await {
        nlog_debug!("Worker: processing {}", msg.kind());
        match msg {
            CommMessage::Quit => break,
            CommMessage::Login { credentials } => {
                let credentials = credentials.unwrap_or_else(|| ctx.credentials.clone());
                handle_login(&mut server, &ctx, &credentials).await;
            }
            CommMessage::RequestTest { reply_to } => {
                handle_request(&mut server, &ctx, &reply_to).await;
            }
            CommMessage::Report { record, reply_to } => {
                handle_report(&mut server, &ctx, record, reply_to.as_ref()).await;
            }
        }
    }

    // Nothing new can arrive once closed; answer whatever is still queued.
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        reject(msg);
    }

    server.disconnect().await;
    write_session(&ctx.session, SessionStatus::LoggedOut);
    nlog_debug!("Worker: exiting");
}

async fn handle_login<S: RemoteServer>(server: &mut S, ctx: &WorkerContext, creds: &Credentials) {
    match with_timeout(ctx.call_timeout, server.login(creds)).await {
        Ok(token) => {
            nlog!("Login succeeded for {}", creds.username);
            write_session(&ctx.session, SessionStatus::Active(token));
        }
        Err(e) => {
            nlog_warn!("Login failed for {}: {}", creds.username, e);
            write_session(&ctx.session, SessionStatus::Failed(e.to_string()));
        }
    }
}

async fn handle_request<S: RemoteServer>(server: &mut S, ctx: &WorkerContext, reply_to: &ReplyTarget) {
    let record = match read_session(&ctx.session) {
        SessionStatus::Active(token) => {
            deliver(reply_to, WorkerReply::TestStarted);
            match with_timeout(ctx.call_timeout, server.run_test(&token)).await {
                Ok(record) => record,
                Err(e) => {
                    nlog_warn!("Test exchange failed: {}", e);
                    ResultsRecord::invalid(format!("test exchange failed: {}", e))
                }
            }
        }
        SessionStatus::Failed(reason) => ResultsRecord::invalid(format!("login failed: {}", reason)),
        SessionStatus::LoggedOut => ResultsRecord::invalid(Error::NotLoggedIn.to_string()),
    };
    nlog_debug!(
        "Worker: test finished valid={} id={}",
        record.is_valid(),
        record.id().short()
    );
    deliver(reply_to, WorkerReply::TestFinished(record));
}

async fn handle_report<S: RemoteServer>(
    server: &mut S,
    ctx: &WorkerContext,
    record: ResultsRecord,
    reply_to: Option<&ReplyTarget>,
) {
    let reply = if !record.is_valid() {
        WorkerReply::ReportFailed("refusing to upload an invalid record".to_string())
    } else if let SessionStatus::Active(token) = read_session(&ctx.session) {
        match with_timeout(ctx.call_timeout, server.report(&token, &record)).await {
            Ok(receipt) => WorkerReply::Reported(receipt),
            Err(e) => {
                nlog_warn!("Report upload failed: {}", e);
                WorkerReply::ReportFailed(e.to_string())
            }
        }
    } else {
        WorkerReply::ReportFailed(Error::NotLoggedIn.to_string())
    };

    if let Some(target) = reply_to {
        deliver(target, reply);
    }
}

fn reject(msg: CommMessage) {
    nlog_debug!("Worker: rejecting {} queued behind QUIT", msg.kind());
    match msg {
        CommMessage::RequestTest { reply_to } => deliver(
            &reply_to,
            WorkerReply::TestFinished(ResultsRecord::invalid(Error::WorkerStopped.to_string())),
        ),
        CommMessage::Report {
            reply_to: Some(reply_to),
            ..
        } => deliver(&reply_to, WorkerReply::ReportFailed(Error::WorkerStopped.to_string())),
        _ => {}
    }
}

fn deliver(target: &ReplyTarget, reply: WorkerReply) {
    if !target.deliver(reply) {
        nlog_debug!("Worker: reply target gone, discarding reply");
    }
}

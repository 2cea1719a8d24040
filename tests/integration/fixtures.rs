//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted `RemoteServer` that logs every call
//! - A wired-up orchestrator harness
//! - A fake line-delimited JSON test server on loopback

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use netgauge::comm::{
    CommunicationWorker, Credentials, RemoteServer, ReportReceipt, SessionToken,
};
use netgauge::results::Metrics;
use netgauge::{Error, EventBus, ResultsRecord, TestLifecycleState, TestOrchestrator};

pub const WAIT: Duration = Duration::from_secs(5);

/// Record with the given latency and a fixed throughput.
pub fn record_with_latency(latency_ms: f64) -> ResultsRecord {
    let mut metrics = Metrics::new();
    metrics.insert("latency_ms".to_string(), latency_ms.into());
    metrics.insert("throughput_mbps".to_string(), 87.5.into());
    ResultsRecord::from_metrics(metrics)
}

pub fn sample_record() -> ResultsRecord {
    record_with_latency(42.0)
}

/// A `RemoteServer` whose behaviour is fixed up front.
///
/// Each call appends `<op>:start` and `<op>:end` to the shared log.
/// `run_test` pops scripted records and falls back to `sample_record()`.
#[derive(Clone, Default)]
pub struct ScriptedServer {
    pub log: Arc<Mutex<Vec<String>>>,
    records: Arc<Mutex<VecDeque<ResultsRecord>>>,
    login_gate: Option<Receiver<()>>,
    login_delay: Duration,
    reject_login: bool,
    fail_tests: bool,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(self, records: Vec<ResultsRecord>) -> Self {
        *self.records.lock().unwrap() = records.into();
        self
    }

    /// Login blocks until the returned sender fires (or is dropped).
    pub fn with_login_gate(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.login_gate = Some(rx);
        (self, tx)
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    pub fn failing_tests(mut self) -> Self {
        self.fail_tests = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn note(&self, entry: &str) {
        self.log.lock().unwrap().push(entry.to_string());
    }
}

impl RemoteServer for ScriptedServer {
    async fn login(&mut self, _credentials: &Credentials) -> netgauge::Result<SessionToken> {
        self.note("login:start");
        if let Some(gate) = &self.login_gate {
            let _ = gate.recv();
        }
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        self.note("login:end");
        if self.reject_login {
            return Err(Error::Server("invalid router token".to_string()));
        }
        Ok(SessionToken("scripted".to_string()))
    }

    async fn run_test(&mut self, _session: &SessionToken) -> netgauge::Result<ResultsRecord> {
        self.note("test:start");
        let next = self.records.lock().unwrap().pop_front();
        self.note("test:end");
        if self.fail_tests {
            return Err(Error::Timeout(Duration::from_secs(1)));
        }
        Ok(next.unwrap_or_else(sample_record))
    }

    async fn report(
        &mut self,
        _session: &SessionToken,
        _record: &ResultsRecord,
    ) -> netgauge::Result<ReportReceipt> {
        self.note("report");
        Ok(ReportReceipt {
            set_id: 11,
            result_id: 12,
        })
    }

    async fn disconnect(&mut self) {
        self.note("disconnect");
    }
}

/// Orchestrator, lifecycle, bus and a started worker, wired together.
pub struct Harness {
    pub orchestrator: TestOrchestrator,
    pub lifecycle: Arc<TestLifecycleState>,
    pub bus: Arc<EventBus>,
    pub worker: CommunicationWorker<ScriptedServer>,
}

impl Harness {
    pub fn new(server: ScriptedServer) -> Self {
        let lifecycle = Arc::new(TestLifecycleState::new());
        let bus = Arc::new(EventBus::new());
        let orchestrator = TestOrchestrator::new(lifecycle.clone(), bus.clone());
        let mut worker = CommunicationWorker::new(server, Credentials::new("router", "token"));
        orchestrator.set_communicator(worker.start().expect("worker should start"));
        Self {
            orchestrator,
            lifecycle,
            bus,
            worker,
        }
    }
}

/// What the fake server saw.
#[derive(Debug, Default)]
pub struct FakeServerLog {
    pub requests: Vec<serde_json::Value>,
}

/// A loopback server speaking the line-delimited JSON protocol.
///
/// `get_config` points the probe at a second listener that streams
/// `payload` bytes per connection.
pub struct FakeTestServer {
    pub addr: String,
    pub log: Arc<Mutex<FakeServerLog>>,
}

impl FakeTestServer {
    pub fn start(accept_login: bool, payload: usize) -> Self {
        let data = TcpListener::bind("127.0.0.1:0").expect("bind data listener");
        let data_port = data.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for mut sock in data.incoming().flatten() {
                std::thread::spawn(move || {
                    let _ = sock.write_all(&vec![0x5a; payload]);
                });
            }
        });

        let control = TcpListener::bind("127.0.0.1:0").expect("bind control listener");
        let addr = control.local_addr().unwrap().to_string();
        let log = Arc::new(Mutex::new(FakeServerLog::default()));
        let server_log = log.clone();
        std::thread::spawn(move || {
            for sock in control.incoming().flatten() {
                let log = server_log.clone();
                std::thread::spawn(move || serve(sock, log, accept_login, data_port));
            }
        });

        Self { addr, log }
    }

    pub fn ops(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|r| r["op"].as_str().unwrap_or("?").to_string())
            .collect()
    }
}

fn serve(
    sock: std::net::TcpStream,
    log: Arc<Mutex<FakeServerLog>>,
    accept_login: bool,
    data_port: u16,
) {
    let mut writer = match sock.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    for line in BufReader::new(sock).lines() {
        let Ok(line) = line else { break };
        let request: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => break,
        };
        let reply = match request["op"].as_str() {
            Some("login") if accept_login => {
                serde_json::json!({"ok": true, "session": "fake-session"})
            }
            Some("login") => serde_json::json!({"ok": false, "reason": "invalid router token"}),
            Some("get_config") => serde_json::json!({
                "ok": true,
                "config": {
                    "set_id": 3,
                    "result_id": 4,
                    "valid_domains": [],
                    "invalid_domains": [],
                    "throughput_server": "127.0.0.1",
                    "port": data_port,
                    "timeout_secs": 2
                }
            }),
            Some("report") => serde_json::json!({"ok": true}),
            _ => serde_json::json!({"ok": false, "reason": "unknown op"}),
        };
        log.lock().unwrap().requests.push(request);
        if writeln!(writer, "{}", reply).is_err() {
            break;
        }
    }
}

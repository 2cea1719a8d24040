//! The seam between the worker and whatever it talks to.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::results::ResultsRecord;

use super::ReportReceipt;

/// Login material handed to the server.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Opaque session issued by the server after login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the server asks the client to measure for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSettings {
    pub set_id: i64,
    pub result_id: i64,
    #[serde(default)]
    pub valid_domains: Vec<String>,
    #[serde(default)]
    pub invalid_domains: Vec<String>,
    pub throughput_server: String,
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    5
}

/// Remote endpoint driven by the communication worker.
///
/// Every method runs on the worker thread, one call at a time, in queue
/// order. Implementations may hold a connection across calls and must
/// release it in `disconnect`.
#[allow(async_fn_in_trait)]
pub trait RemoteServer {
    async fn login(&mut self, credentials: &Credentials) -> Result<SessionToken>;

    /// Run one test exchange and build its record.
    async fn run_test(&mut self, session: &SessionToken) -> Result<ResultsRecord>;

    /// Upload the metrics of a valid record from the latest run.
    async fn report(
        &mut self,
        session: &SessionToken,
        record: &ResultsRecord,
    ) -> Result<ReportReceipt>;

    async fn disconnect(&mut self) {}
}

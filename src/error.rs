use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Server refused request: {0}")]
    Server(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("Invalid results record: {0}")]
    InvalidRecord(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("No communication worker bound to the orchestrator")]
    CommunicatorNotBound,

    #[error("Communication worker is not running")]
    WorkerStopped,

    #[error("Communication worker was already started")]
    WorkerAlreadyStarted,
}

impl Error {
    /// Whether the failure originated on the network side of the worker.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::Server(_)
                | Error::Protocol(_)
                | Error::NotLoggedIn
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

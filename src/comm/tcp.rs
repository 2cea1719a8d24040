//! Line-delimited JSON transport to the test server.
//!
//! One request per line, one reply per line, over a single TCP connection
//! that is opened on first use and held until `disconnect`. An I/O failure
//! drops the connection; the next exchange reconnects.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::{Config, ProbeConfig};
use crate::error::{Error, Result};
use crate::results::{Metrics, ResultsRecord};
use crate::util::with_timeout;
use crate::{nlog_debug, nlog_trace};

use super::{run_probe, Credentials, RemoteServer, ReportReceipt, SessionToken, TestSettings};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Login {
        username: &'a str,
        token: &'a str,
    },
    GetConfig {
        session: &'a str,
    },
    Report {
        session: &'a str,
        set_id: i64,
        result_id: i64,
        metrics: &'a Metrics,
    },
}

impl Request<'_> {
    fn op(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::GetConfig { .. } => "get_config",
            Request::Report { .. } => "report",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    config: Option<TestSettings>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// [`RemoteServer`] over a plain TCP connection.
pub struct TcpServer {
    addr: String,
    exchange_timeout: Duration,
    probe: ProbeConfig,
    conn: Option<Connection>,
    settings: Option<TestSettings>,
}

impl TcpServer {
    pub fn new(addr: impl Into<String>, exchange_timeout: Duration, probe: ProbeConfig) -> Self {
        Self {
            addr: addr.into(),
            exchange_timeout,
            probe,
            conn: None,
            settings: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server.clone(),
            config.exchange_timeout(),
            config.probe.clone(),
        )
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Settings handed out by the latest `get_config`.
    pub fn last_settings(&self) -> Option<&TestSettings> {
        self.settings.as_ref()
    }

    async fn connection(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            nlog_debug!("TcpServer: connecting to {}", self.addr);
            let stream = with_timeout(self.exchange_timeout, async {
                Ok(TcpStream::connect(&self.addr).await?)
            })
            .await?;
            stream.set_nodelay(true)?;
            let (read, writer) = stream.into_split();
            self.conn = Some(Connection {
                reader: BufReader::new(read),
                writer,
            });
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Protocol("connection unavailable".to_string()))
    }

    async fn exchange(&mut self, request: &Request<'_>) -> Result<Reply> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let op = request.op();
        let timeout = self.exchange_timeout;

        let result = async {
            let conn = self.connection().await?;
            with_timeout(timeout, async {
                conn.writer.write_all(line.as_bytes()).await?;
                conn.writer.flush().await?;
                let mut reply = String::new();
                if conn.reader.read_line(&mut reply).await? == 0 {
                    return Err(Error::Protocol("server closed the connection".to_string()));
                }
                Ok(reply)
            })
            .await
        }
        .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                nlog_debug!("TcpServer: {} failed, dropping connection: {}", op, e);
                self.conn = None;
                return Err(e);
            }
        };
        nlog_trace!("TcpServer: {} -> {}", op, raw.trim_end());

        let reply: Reply = serde_json::from_str(&raw)
            .map_err(|e| Error::Protocol(format!("malformed {} reply: {}", op, e)))?;
        if !reply.ok {
            return Err(Error::Server(
                reply.reason.unwrap_or_else(|| format!("{} rejected", op)),
            ));
        }
        Ok(reply)
    }
}

impl RemoteServer for TcpServer {
    async fn login(&mut self, credentials: &Credentials) -> Result<SessionToken> {
        let reply = self
            .exchange(&Request::Login {
                username: &credentials.username,
                token: &credentials.token,
            })
            .await?;
        reply
            .session
            .map(SessionToken)
            .ok_or_else(|| Error::Protocol("login reply without session".to_string()))
    }

    async fn run_test(&mut self, session: &SessionToken) -> Result<ResultsRecord> {
        let reply = self
            .exchange(&Request::GetConfig {
                session: session.as_str(),
            })
            .await?;
        let settings = reply
            .config
            .ok_or_else(|| Error::Protocol("get_config reply without config".to_string()))?;
        nlog_debug!(
            "TcpServer: test set {} result {} against {}:{}",
            settings.set_id,
            settings.result_id,
            settings.throughput_server,
            settings.port
        );

        let metrics = run_probe(&settings, &self.probe).await?;
        self.settings = Some(settings);
        Ok(ResultsRecord::from_metrics(metrics))
    }

    async fn report(
        &mut self,
        session: &SessionToken,
        record: &ResultsRecord,
    ) -> Result<ReportReceipt> {
        let (set_id, result_id) = match &self.settings {
            Some(s) => (s.set_id, s.result_id),
            None => return Err(Error::Protocol("no test settings to report against".to_string())),
        };
        self.exchange(&Request::Report {
            session: session.as_str(),
            set_id,
            result_id,
            metrics: record.metrics(),
        })
        .await?;
        Ok(ReportReceipt { set_id, result_id })
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.writer.shutdown().await;
            nlog_debug!("TcpServer: disconnected from {}", self.addr);
        }
    }
}

//! Measurements executed on the worker thread for one test exchange.
//!
//! The server decides what to measure through [`TestSettings`]; this module
//! only carries it out and reports raw numbers.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at};

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::nlog_trace;
use crate::results::Metrics;

use super::TestSettings;

const READ_BUF: usize = 64 * 1024;

/// Run every measurement the settings ask for.
///
/// Fails only when the measurement target is unreachable; DNS outcomes are
/// counted rather than treated as errors.
pub async fn run_probe(settings: &TestSettings, probe: &ProbeConfig) -> Result<Metrics> {
    let target = format!("{}:{}", settings.throughput_server, settings.port);
    let step_timeout = Duration::from_secs(settings.timeout_secs.max(1));

    let mut metrics = Metrics::new();
    metrics.insert(
        "latency_ms".to_string(),
        measure_latency(&target, probe.latency_samples.max(1), step_timeout)
            .await?
            .into(),
    );
    metrics.insert(
        "throughput_mbps".to_string(),
        measure_throughput(&target, probe.throughput_window(), step_timeout)
            .await?
            .into(),
    );

    let resolved = count_resolving(&settings.valid_domains, step_timeout).await;
    let rejected = settings.invalid_domains.len()
        - count_resolving(&settings.invalid_domains, step_timeout).await;
    metrics.insert("dns_resolved".to_string(), (resolved as u64).into());
    metrics.insert("dns_rejected".to_string(), (rejected as u64).into());
    metrics.insert("target".to_string(), target.into());

    Ok(metrics)
}

/// Mean TCP connect time in milliseconds over the successful samples.
async fn measure_latency(target: &str, samples: u32, step_timeout: Duration) -> Result<f64> {
    let mut total = Duration::ZERO;
    let mut ok = 0u32;
    let mut last_err = None;

    for _ in 0..samples {
        let start = Instant::now();
        match timeout(step_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                total += start.elapsed();
                ok += 1;
            }
            Ok(Err(e)) => last_err = Some(Error::Io(e)),
            Err(_) => last_err = Some(Error::Timeout(step_timeout)),
        }
    }

    if ok == 0 {
        return Err(last_err.unwrap_or(Error::Timeout(step_timeout)));
    }
    let mean_ms = total.as_secs_f64() * 1000.0 / f64::from(ok);
    nlog_trace!("Probe: latency {:.2}ms over {} samples", mean_ms, ok);
    Ok(mean_ms)
}

/// Read from the target until EOF or `window` elapses; megabits per second.
async fn measure_throughput(target: &str, window: Duration, step_timeout: Duration) -> Result<f64> {
    let mut stream = match timeout(step_timeout, TcpStream::connect(target)).await {
        Ok(conn) => conn?,
        Err(_) => return Err(Error::Timeout(step_timeout)),
    };

    let mut buf = vec![0u8; READ_BUF];
    let mut bytes = 0u64;
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + window;

    loop {
        match timeout_at(deadline, stream.read(&mut buf)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) => return Err(Error::Io(e)),
        }
    }

    let secs = start.elapsed().as_secs_f64().max(1e-6);
    let mbps = (bytes as f64 * 8.0) / secs / 1_000_000.0;
    nlog_trace!("Probe: {} bytes in {:.3}s = {:.2}Mbps", bytes, secs, mbps);
    Ok(mbps)
}

async fn count_resolving(domains: &[String], step_timeout: Duration) -> usize {
    let mut count = 0;
    for domain in domains {
        let resolved = match timeout(step_timeout, lookup_host((domain.as_str(), 0))).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(_)) | Err(_) => false,
        };
        nlog_trace!("Probe: dns {} resolved={}", domain, resolved);
        if resolved {
            count += 1;
        }
    }
    count
}

//! Service readiness polling.
//!
//! Readiness is edge-triggered: `wait_ready` returns on the first `200 OK`
//! from the health endpoint and nothing polls afterwards. Connection
//! refused, unreachable hosts and per-attempt timeouts all count as
//! "not ready yet".

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use url::Url;

/// Outcome of a single health request.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub attempted_at: DateTime<Local>,
    pub elapsed_ms: u64,
    /// HTTP status when a response arrived at all.
    pub status: Option<u16>,
}

pub struct ReadinessProbe {
    client: Client,
    attempt_timeout: Duration,
}

impl ReadinessProbe {
    /// `attempt_timeout` bounds each individual request.
    pub fn new(attempt_timeout: Duration) -> Result<Self> {
        // Loopback only: never route health checks through a system proxy.
        let client = Client::builder()
            .no_proxy()
            .build()
            .context("failed to create HTTP client for readiness probe")?;
        Ok(Self {
            client,
            attempt_timeout,
        })
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Issue one `GET` and report whether it returned 200 within `timeout`.
    pub async fn probe_once(&self, url: &Url, timeout: Duration) -> ProbeResult {
        let attempted_at = Local::now();
        let started = Instant::now();
        let status = match self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => Some(response.status()),
            Err(e) => {
                debug!("Health probe {} not ready: {}", url, e);
                None
            }
        };
        ProbeResult {
            success: status == Some(StatusCode::OK),
            attempted_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: status.map(|s| s.as_u16()),
        }
    }

    /// Poll `url` every `interval` until it answers 200 or `timeout` elapses.
    ///
    /// Returns `true` on the first success and `false` once the time budget
    /// is spent. Never overruns `timeout` by more than scheduling jitter:
    /// the last attempt is cut short to the remaining budget.
    pub async fn wait_ready(&self, url: &Url, timeout: Duration, interval: Duration) -> bool {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts: u32 = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let result = self
                .probe_once(url, self.attempt_timeout.min(remaining))
                .await;
            if result.success {
                info!(
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Service ready at {}",
                    url
                );
                return true;
            }
            debug!(
                attempt = attempts,
                status = ?result.status,
                elapsed_ms = result.elapsed_ms,
                "Health probe failed"
            );

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }

        debug!(attempts, "Readiness budget of {:?} exhausted", timeout);
        false
    }
}

//! Health check scheduler

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outcome of pinging one database.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub database: String,
    pub healthy: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub entry: String,
    pub checked_at: DateTime<Utc>,
    pub databases: Vec<ProbeResult>,
}

impl HealthReport {
    /// An entry without live databases is healthy.
    pub fn is_healthy(&self) -> bool {
        self.databases.iter().all(|db| db.healthy)
    }
}

/// Something the checker can ping on a schedule.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    fn entry_name(&self) -> &str;

    async fn probe(&self) -> HealthReport;
}

/// Track consecutive failures per database
type FailureTracker = HashMap<String, u32>;

/// Periodic prober for one entry
pub struct HealthChecker {
    target: Arc<dyn Probe>,
    period: Duration,
    failures: FailureTracker,
}

impl HealthChecker {
    pub fn new(target: Arc<dyn Probe>, period: Duration) -> Self {
        Self {
            target,
            period,
            failures: HashMap::new(),
        }
    }

    /// Start the check loop on the runtime. The first probe runs one
    /// period after the call.
    pub fn spawn(self) -> HealthMonitor {
        let cancel = CancellationToken::new();
        let period = self.period;
        let task = tokio::spawn(self.run(cancel.clone()));

        HealthMonitor {
            cancel,
            task: Some(task),
            period,
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            "Starting health checker for entry {} every {:?}",
            self.target.entry_name(),
            self.period
        );

        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    self.check_once().await;
                }
            }
        }

        tracing::info!("Health checker for entry {} stopped", self.target.entry_name());
    }

    async fn check_once(&mut self) -> HealthReport {
        let report = self.target.probe().await;

        for db in &report.databases {
            if db.healthy {
                if let Some(prev_count) = self.failures.remove(&db.database) {
                    tracing::info!(
                        "Health check recovered for entry {} database [{}] after {} failures",
                        report.entry,
                        db.database,
                        prev_count
                    );
                }
                continue;
            }

            let count = self.failures.entry(db.database.clone()).or_insert(0);
            *count += 1;

            tracing::warn!(
                "Health check failed for entry {} database [{}]: {} (consecutive failures = {})",
                report.entry,
                db.database,
                db.error.as_deref().unwrap_or("unknown error"),
                *count
            );
        }

        report
    }
}

/// Handle to a running [`HealthChecker`]. Dropping it cancels the loop
/// without waiting.
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    period: Duration,
}

impl HealthMonitor {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait for it, at most one period. A probe still
    /// in flight after that is aborted.
    pub async fn stop(mut self) {
        self.cancel.cancel();

        let Some(mut task) = self.task.take() else {
            return;
        };

        match tokio::time::timeout(self.period, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::warn!("Health checker task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Health checker did not stop within {:?}, aborting",
                    self.period
                );
                task.abort();
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

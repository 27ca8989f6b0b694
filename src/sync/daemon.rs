// ABOUTME: SyncDaemon - repeats watermark-driven runs on an interval
// ABOUTME: Retries transient failures with backoff and stops on shutdown signal

use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::interval;

use super::orchestrator::{RunFailure, SyncOutcome, SyncRunner, SyncTarget};
use super::selector::ChangeSource;
use crate::utils::retry_with_backoff;

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync runs
    pub interval: Duration,
    /// Retries for a run that failed with a retryable error
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each attempt
    pub retry_delay: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Totals across the runs of one daemon lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStats {
    pub runs: u64,
    pub failed_runs: u64,
    pub rows_applied: u64,
}

/// Drives a [`SyncRunner`] for one source, once or on an interval.
pub struct SyncDaemon<C, T> {
    runner: SyncRunner<C, T>,
    source_name: String,
    config: DaemonConfig,
}

impl<C, T> SyncDaemon<C, T>
where
    C: ChangeSource,
    T: SyncTarget,
{
    pub fn new(runner: SyncRunner<C, T>, source_name: &str, config: DaemonConfig) -> Self {
        Self {
            runner,
            source_name: source_name.to_string(),
            config,
        }
    }

    pub fn runner(&self) -> &SyncRunner<C, T> {
        &self.runner
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Run one sync, retrying retryable failures with exponential backoff.
    ///
    /// Every attempt is a complete run with its own run id, so a retry after
    /// an apply-without-advance reselects and reapplies the same rows.
    pub async fn run_once(&self) -> Result<SyncOutcome, RunFailure> {
        retry_with_backoff(
            || self.runner.run_sync(&self.source_name),
            RunFailure::is_retryable,
            self.config.max_retries,
            self.config.retry_delay,
        )
        .await
    }

    /// Run syncs at the configured interval until `shutdown` fires.
    ///
    /// A failed run is logged and the loop continues; the next tick starts
    /// from whatever marker is stored.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> DaemonStats {
        let mut ticker = interval(self.config.interval);
        let mut stats = DaemonStats::default();

        tracing::info!(
            "Starting SyncDaemon for '{}' with interval={:?}",
            self.source_name,
            self.config.interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = ticker.tick() => {
                    stats.runs += 1;
                    let started = Instant::now();

                    // A run interrupted here has either committed or not; both are resumable
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync run, aborting");
                            break;
                        }
                        result = self.run_once() => {
                            match result {
                                Ok(outcome) => {
                                    stats.rows_applied += outcome.rows_applied() as u64;
                                    tracing::info!(
                                        "Run {} completed: {} rows in {}ms",
                                        stats.runs,
                                        outcome.rows_applied(),
                                        started.elapsed().as_millis()
                                    );
                                }
                                Err(failure) => {
                                    stats.failed_runs += 1;
                                    // Log with :? to show the full error chain
                                    tracing::error!("Run {} failed: {:?}", stats.runs, failure);
                                }
                            }
                        }
                    }
                }
            }
        }

        stats
    }
}

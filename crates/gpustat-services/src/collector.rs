//! Per-server poll loop
//!
//! ```text
//! Idle -> Polling <-> BackoffRetry -> Stopped
//! ```
//!
//! A successful cycle hands one `Snapshot` to the sink and sleeps for the
//! server's poll interval. A failed cycle retries immediately until
//! `max_retries` consecutive failures, then the collector gives up. The
//! session is disconnected exactly once however the loop ends.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use gpustat_core::{
    parse_gpu_stats, ServerTarget, Settings, Snapshot, PROCESS_QUERY, STATS_QUERY, UUID_QUERY,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::remote::{CommandRunner, RemoteCommandClient};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("{query} query failed: {stderr}")]
    Command { query: &'static str, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Polling,
    BackoffRetry,
    Stopped,
}

/// Why a collector loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorExit {
    /// `max_retries` cycles failed in a row; a deliberate stop, not a crash
    GaveUp { consecutive_failures: u32 },
    Cancelled,
    /// The loop panicked
    Faulted(String),
}

impl std::fmt::Display for CollectorExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorExit::GaveUp {
                consecutive_failures,
            } => write!(f, "gave up after {} consecutive failures", consecutive_failures),
            CollectorExit::Cancelled => write!(f, "cancelled"),
            CollectorExit::Faulted(message) => write!(f, "faulted: {}", message),
        }
    }
}

pub struct Collector<R: CommandRunner = RemoteCommandClient> {
    target: ServerTarget,
    runner: R,
    max_retries: u32,
    state: CollectorState,
}

impl Collector<RemoteCommandClient> {
    /// Collector polling `target` over SSH with the configured timeouts
    pub fn over_ssh(target: ServerTarget, settings: &Settings) -> Self {
        let client = RemoteCommandClient::new(&target, settings.connect_timeout());
        Self::new(target, client).with_max_retries(settings.max_retries)
    }
}

impl<R: CommandRunner> Collector<R> {
    pub fn new(target: ServerTarget, runner: R) -> Self {
        Self {
            target,
            runner,
            max_retries: DEFAULT_MAX_RETRIES,
            state: CollectorState::Idle,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn target(&self) -> &ServerTarget {
        &self.target
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Close the session after standalone `poll_once` calls. `run` does
    /// this itself.
    pub async fn disconnect(&mut self) {
        self.runner.disconnect().await;
    }

    /// Run one poll cycle: stats, UUIDs, then processes.
    ///
    /// The three queries are separate commands, so a process can start or
    /// exit between them. Any failed command fails the whole cycle.
    #[instrument(skip(self), fields(server = %self.target.name))]
    pub async fn poll_once(&mut self) -> Result<Snapshot, CollectorError> {
        let stats = self.query("GPU stats", STATS_QUERY).await?;
        let uuids = self.query("GPU UUID", UUID_QUERY).await?;
        let processes = self.query("process", PROCESS_QUERY).await?;

        let gpus = parse_gpu_stats(&stats, &uuids, &processes);
        Ok(Snapshot::new(
            self.target.name.clone(),
            self.target.host.clone(),
            gpus,
        ))
    }

    async fn query(&mut self, query: &'static str, command: &str) -> Result<String, CollectorError> {
        let output = self.runner.execute(command).await;
        if output.success {
            return Ok(output.stdout);
        }

        error!(
            "Failed to collect {} info from {}: {}",
            query, self.target.name, output.stderr
        );
        Err(CollectorError::Command {
            query,
            stderr: output.stderr,
        })
    }

    /// Poll until cancelled or until `max_retries` consecutive cycles fail.
    ///
    /// `sink` receives every snapshot. What it does with it (including
    /// failing to store it) has no effect on the retry counter.
    #[instrument(skip_all, fields(server = %self.target.name))]
    pub async fn run<F>(&mut self, cancel: CancellationToken, mut sink: F) -> CollectorExit
    where
        F: FnMut(Snapshot) + Send,
    {
        info!(
            interval_secs = self.target.poll_interval.as_secs_f64(),
            max_retries = self.max_retries,
            "Starting GPU stats collection"
        );

        let outcome = AssertUnwindSafe(self.poll_loop(&cancel, &mut sink))
            .catch_unwind()
            .await;

        let exit = match outcome {
            Ok(exit) => exit,
            Err(panic) => CollectorExit::Faulted(panic_message(panic.as_ref())),
        };

        self.runner.disconnect().await;
        self.transition(CollectorState::Stopped);

        match &exit {
            CollectorExit::GaveUp {
                consecutive_failures,
            } => error!(
                consecutive_failures,
                "Max retries exceeded for {}, giving up", self.target.name
            ),
            CollectorExit::Cancelled => info!("Collection stopped for {}", self.target.name),
            CollectorExit::Faulted(message) => {
                error!("Collector for {} faulted: {}", self.target.name, message)
            }
        }

        exit
    }

    async fn poll_loop<F>(&mut self, cancel: &CancellationToken, sink: &mut F) -> CollectorExit
    where
        F: FnMut(Snapshot) + Send,
    {
        let mut failures: u32 = 0;
        self.transition(CollectorState::Polling);

        loop {
            let cycle = tokio::select! {
                biased;
                _ = cancel.cancelled() => return CollectorExit::Cancelled,
                result = self.poll_once() => result,
            };

            match cycle {
                Ok(snapshot) => {
                    failures = 0;
                    self.transition(CollectorState::Polling);
                    debug!(
                        gpus = snapshot.gpus.len(),
                        processes = snapshot.process_count(),
                        "Collected snapshot"
                    );
                    sink(snapshot);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return CollectorExit::Cancelled,
                        _ = tokio::time::sleep(self.target.poll_interval) => {}
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.max_retries {
                        return CollectorExit::GaveUp {
                            consecutive_failures: failures,
                        };
                    }
                    self.transition(CollectorState::BackoffRetry);
                    warn!(
                        "Failed to collect data from {}: {}. Retry {}/{}",
                        self.target.name, e, failures, self.max_retries
                    );
                }
            }
        }
    }

    fn transition(&mut self, next: CollectorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Collector state change");
            self.state = next;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

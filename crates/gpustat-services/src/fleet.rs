use std::sync::Arc;

use gpustat_core::{GpuStatConfig, ServerTarget, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::collector::{Collector, CollectorExit};
use crate::remote::{CommandRunner, RemoteCommandClient};
use crate::store::Store;

/// How one server's collector ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub server: String,
    pub exit: CollectorExit,
}

/// One collector per configured server, all feeding a shared store
pub struct Fleet {
    targets: Vec<ServerTarget>,
    settings: Settings,
    store: Arc<Store>,
}

impl Fleet {
    pub fn new(targets: Vec<ServerTarget>, settings: Settings, store: Arc<Store>) -> Self {
        Self {
            targets,
            settings,
            store,
        }
    }

    pub fn from_config(config: &GpuStatConfig, store: Arc<Store>) -> Self {
        Self::new(config.targets(), config.settings.clone(), store)
    }

    pub fn targets(&self) -> &[ServerTarget] {
        &self.targets
    }

    /// Poll every server over SSH until each collector exits
    pub async fn run(self, cancel: CancellationToken) -> Vec<WorkerReport> {
        self.run_with(cancel, |target, settings| {
            RemoteCommandClient::new(target, settings.connect_timeout())
        })
        .await
    }

    /// Like `run`, with the runner for each server built by `connect`.
    ///
    /// Returns once every worker has finished, in config order. Cancelling
    /// `cancel` stops all workers.
    #[instrument(skip_all, fields(servers = self.targets.len()))]
    pub async fn run_with<R, F>(self, cancel: CancellationToken, connect: F) -> Vec<WorkerReport>
    where
        R: CommandRunner + 'static,
        F: Fn(&ServerTarget, &Settings) -> R,
    {
        let mut workers = Vec::with_capacity(self.targets.len());

        for target in self.targets {
            let server = target.name.clone();
            let runner = connect(&target, &self.settings);
            let mut collector =
                Collector::new(target, runner).with_max_retries(self.settings.max_retries);
            let store = Arc::clone(&self.store);
            let cancel = cancel.child_token();

            info!("Starting collector for {}", collector.target());
            let handle = tokio::spawn(async move {
                collector
                    .run(cancel, move |snapshot| {
                        // A failed write is logged by the store and does not
                        // count against the collector.
                        store.store(&snapshot);
                    })
                    .await
            });
            workers.push((server, handle));
        }

        let mut reports = Vec::with_capacity(workers.len());
        for (server, handle) in workers {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!("Worker for {} did not finish cleanly: {}", server, e);
                    CollectorExit::Faulted(e.to_string())
                }
            };
            info!("Collector for {} finished: {}", server, exit);
            reports.push(WorkerReport { server, exit });
        }

        reports
    }
}

mod collector;
mod fleet;
pub mod remote;
mod store;

pub use collector::{Collector, CollectorError, CollectorExit, CollectorState, DEFAULT_MAX_RETRIES};
pub use fleet::{Fleet, WorkerReport};
pub use remote::{
    CommandOutput, CommandRunner, Connector, RemoteCommandClient, RemoteError, ShellSession,
    SshConnector, CONNECT_FAILED,
};
pub use store::{Store, StoreError, StoreReceipt};

// Re-export core types so callers only need this crate
pub use gpustat_core::{
    GpuRecord, GpuStatConfig, ProcessRecord, ServerTarget, Settings, Snapshot,
};

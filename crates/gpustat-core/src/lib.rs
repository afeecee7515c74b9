// Domain modules
pub mod config;
pub mod error;
pub mod gpu;
pub mod nvidia_smi;
pub mod server;

pub use config::{GpuStatConfig, ServerConfig, Settings};
pub use error::{ConfigError, ParseError, Result};
pub use gpu::{GpuRecord, ProcessRecord, Snapshot, UNKNOWN_UUID};
pub use nvidia_smi::{parse_gpu_stats, PROCESS_QUERY, STATS_QUERY, UUID_QUERY};
pub use server::ServerTarget;

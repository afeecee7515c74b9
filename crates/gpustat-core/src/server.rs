use std::path::PathBuf;
use std::time::Duration;

/// A remote machine to poll, resolved from config. Read-only for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub name: String,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: PathBuf,
    pub poll_interval: Duration,
}

impl ServerTarget {
    /// `host:port` address used for the TCP connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}@{}:{})", self.name, self.user, self.host, self.port)
    }
}

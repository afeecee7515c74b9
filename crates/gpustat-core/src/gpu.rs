use chrono::{DateTime, Local};
use serde::Serialize;

/// UUID recorded for a GPU whose index was missing from the UUID query.
pub const UNKNOWN_UUID: &str = "unknown";

/// A compute process running on one GPU
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub gpu_uuid: String,
    pub used_memory_mb: f64,
}

/// One GPU as reported by a single poll.
///
/// `memory_used_mb + memory_free_mb` roughly equals `memory_total_mb`, but
/// the vendor numbers are stored as reported and never checked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuRecord {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub utilization_gpu_pct: f64,
    pub utilization_mem_pct: f64,
    pub memory_total_mb: f64,
    pub memory_used_mb: f64,
    pub memory_free_mb: f64,
    pub temperature_c: f64,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub fan_speed_pct: f64,
    pub processes: Vec<ProcessRecord>,
}

impl GpuRecord {
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }
}

/// Everything collected from one server in one successful poll cycle
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Local>,
    pub server_name: String,
    pub host: String,
    pub gpus: Vec<GpuRecord>,
}

impl Snapshot {
    pub fn new(server_name: impl Into<String>, host: impl Into<String>, gpus: Vec<GpuRecord>) -> Self {
        Self {
            captured_at: Local::now(),
            server_name: server_name.into(),
            host: host.into(),
            gpus,
        }
    }

    /// ISO-8601 local timestamp as written to the CSV files
    pub fn timestamp(&self) -> String {
        self.captured_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }

    pub fn process_count(&self) -> usize {
        self.gpus.iter().map(GpuRecord::process_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_is_iso8601_local() {
        let mut snapshot = Snapshot::new("box", "10.0.0.1", Vec::new());
        snapshot.captured_at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(snapshot.timestamp(), "2024-03-09T07:05:01.000000");
    }
}

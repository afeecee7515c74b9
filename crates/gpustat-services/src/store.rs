//! Append-only CSV storage, partitioned by server and by day
//!
//! ```text
//! <base_dir>/<server>/gpu_stats_<YYYY-MM-DD>.csv
//! <base_dir>/<server>/gpu_<index>_processes_<YYYY-MM-DD>.csv
//! ```
//!
//! The date is the local wall-clock date when the row is written, not when
//! the snapshot was captured: a snapshot taken just before midnight and
//! written just after lands in the next day's file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use dashmap::DashMap;
use gpustat_core::{GpuRecord, ProcessRecord, Snapshot};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Column order is the on-disk schema. Never reorder.
#[derive(Serialize)]
struct GpuRow<'a> {
    timestamp: &'a str,
    gpu_index: u32,
    gpu_name: &'a str,
    utilization_gpu: f64,
    utilization_memory: f64,
    memory_total: f64,
    memory_used: f64,
    memory_free: f64,
    temperature: f64,
    power_draw: f64,
    power_limit: f64,
    fan_speed: f64,
    process_count: usize,
}

impl<'a> GpuRow<'a> {
    fn new(timestamp: &'a str, gpu: &'a GpuRecord) -> Self {
        Self {
            timestamp,
            gpu_index: gpu.index,
            gpu_name: &gpu.name,
            utilization_gpu: gpu.utilization_gpu_pct,
            utilization_memory: gpu.utilization_mem_pct,
            memory_total: gpu.memory_total_mb,
            memory_used: gpu.memory_used_mb,
            memory_free: gpu.memory_free_mb,
            temperature: gpu.temperature_c,
            power_draw: gpu.power_draw_w,
            power_limit: gpu.power_limit_w,
            fan_speed: gpu.fan_speed_pct,
            process_count: gpu.process_count(),
        }
    }
}

#[derive(Serialize)]
struct ProcessRow<'a> {
    timestamp: &'a str,
    gpu_index: u32,
    pid: u32,
    process_name: &'a str,
    used_memory: f64,
}

impl<'a> ProcessRow<'a> {
    fn new(timestamp: &'a str, gpu_index: u32, process: &'a ProcessRecord) -> Self {
        Self {
            timestamp,
            gpu_index,
            pid: process.pid,
            process_name: &process.name,
            used_memory: process.used_memory_mb,
        }
    }
}

/// Rows written by one `store` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReceipt {
    pub gpu_rows: usize,
    pub process_rows: usize,
}

/// Shared by every collector. Holds no snapshot state between calls.
pub struct Store {
    base_dir: PathBuf,
    /// Serializes writers of the same server's files
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Store {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        info!("Data store initialized at {:?}", base_dir);

        Ok(Self {
            base_dir,
            locks: DashMap::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn server_dir(&self, server_name: &str) -> PathBuf {
        self.base_dir.join(server_name)
    }

    pub fn stats_path(&self, server_name: &str, date: NaiveDate) -> PathBuf {
        self.server_dir(server_name)
            .join(format!("gpu_stats_{}.csv", date.format("%Y-%m-%d")))
    }

    pub fn processes_path(&self, server_name: &str, gpu_index: u32, date: NaiveDate) -> PathBuf {
        self.server_dir(server_name).join(format!(
            "gpu_{}_processes_{}.csv",
            gpu_index,
            date.format("%Y-%m-%d")
        ))
    }

    /// Append `snapshot` to today's files. Returns false if anything failed;
    /// the failure is logged and not retried.
    pub fn store(&self, snapshot: &Snapshot) -> bool {
        match self.try_store(snapshot) {
            Ok(receipt) => {
                debug!(
                    server = %snapshot.server_name,
                    gpu_rows = receipt.gpu_rows,
                    process_rows = receipt.process_rows,
                    "Stored snapshot"
                );
                true
            }
            Err(e) => {
                error!(server = %snapshot.server_name, "Error storing data: {}", e);
                false
            }
        }
    }

    pub fn try_store(&self, snapshot: &Snapshot) -> Result<StoreReceipt> {
        self.store_on(snapshot, Local::now().date_naive())
    }

    fn store_on(&self, snapshot: &Snapshot, date: NaiveDate) -> Result<StoreReceipt> {
        let server = snapshot.server_name.as_str();
        let lock = self.locks.entry(server.to_string()).or_default().value().clone();
        let _guard = lock.lock().map_err(|_| StoreError::LockPoisoned)?;

        fs::create_dir_all(self.server_dir(server))?;

        let mut receipt = StoreReceipt::default();
        if snapshot.gpus.is_empty() {
            return Ok(receipt);
        }

        let timestamp = snapshot.timestamp();
        let mut stats = append_writer(&self.stats_path(server, date))?;

        for gpu in &snapshot.gpus {
            stats.serialize(GpuRow::new(&timestamp, gpu))?;
            receipt.gpu_rows += 1;

            if gpu.processes.is_empty() {
                continue;
            }

            let mut processes = append_writer(&self.processes_path(server, gpu.index, date))?;
            for process in &gpu.processes {
                processes.serialize(ProcessRow::new(&timestamp, gpu.index, process))?;
                receipt.process_rows += 1;
            }
            processes.flush()?;
        }

        stats.flush()?;
        Ok(receipt)
    }
}

/// Open `path` for appending. The header is written with the first row
/// only when the file is new or still empty.
fn append_writer(path: &Path) -> Result<csv::Writer<File>> {
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const STATS_HEADER: &str = "timestamp,gpu_index,gpu_name,utilization_gpu,utilization_memory,memory_total,memory_used,memory_free,temperature,power_draw,power_limit,fan_speed,process_count";
    const PROCESS_HEADER: &str = "timestamp,gpu_index,pid,process_name,used_memory";

    fn gpu(index: u32, processes: Vec<ProcessRecord>) -> GpuRecord {
        GpuRecord {
            index,
            name: "Tesla T4".to_string(),
            uuid: format!("GPU-{}", index),
            utilization_gpu_pct: 10.0,
            utilization_mem_pct: 5.0,
            memory_total_mb: 15360.0,
            memory_used_mb: 2000.0,
            memory_free_mb: 13360.0,
            temperature_c: 45.0,
            power_draw_w: 20.5,
            power_limit_w: 70.0,
            fan_speed_pct: 0.0,
            processes,
        }
    }

    fn process(pid: u32, gpu_index: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: "python".to_string(),
            gpu_uuid: format!("GPU-{}", gpu_index),
            used_memory_mb: 512.0,
        }
    }

    fn snapshot(gpus: Vec<GpuRecord>) -> Snapshot {
        let mut snapshot = Snapshot::new("gpu-box-1", "10.0.0.5", gpus);
        snapshot.captured_at = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        snapshot
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_header_written_once_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        store.store_on(&snapshot(vec![gpu(0, vec![]), gpu(1, vec![])]), day()).unwrap();
        store
            .store_on(&snapshot(vec![gpu(0, vec![]), gpu(1, vec![]), gpu(2, vec![])]), day())
            .unwrap();

        let rows = lines(&store.stats_path("gpu-box-1", day()));
        assert_eq!(rows.len(), 1 + 2 + 3);
        assert_eq!(rows[0], STATS_HEADER);
        assert_eq!(rows.iter().filter(|l| l.starts_with("timestamp")).count(), 1);
        assert_eq!(
            rows[1],
            "2024-05-01T12:30:00.000000,0,Tesla T4,10.0,5.0,15360.0,2000.0,13360.0,45.0,20.5,70.0,0.0,0"
        );
    }

    #[test]
    fn test_process_files_only_for_busy_gpus() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let receipt = store
            .store_on(
                &snapshot(vec![gpu(0, vec![]), gpu(1, vec![process(7, 1), process(8, 1)])]),
                day(),
            )
            .unwrap();
        store
            .store_on(&snapshot(vec![gpu(0, vec![]), gpu(1, vec![process(9, 1)])]), day())
            .unwrap();

        assert_eq!(
            receipt,
            StoreReceipt {
                gpu_rows: 2,
                process_rows: 2
            }
        );
        assert!(!store.processes_path("gpu-box-1", 0, day()).exists());

        let rows = lines(&store.processes_path("gpu-box-1", 1, day()));
        assert_eq!(rows[0], PROCESS_HEADER);
        assert_eq!(rows[1], "2024-05-01T12:30:00.000000,1,7,python,512.0");
        assert_eq!(rows.len(), 1 + 3);

        let stats = lines(&store.stats_path("gpu-box-1", day()));
        assert!(stats[2].ends_with(",2"));
        assert!(stats[4].ends_with(",1"));
    }

    #[test]
    fn test_date_is_taken_at_write_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let mut late = snapshot(vec![gpu(0, vec![])]);
        late.captured_at = Local::now() - Duration::days(3);

        let before = Local::now().date_naive();
        assert!(store.store(&late));
        let after = Local::now().date_naive();

        let written = [before, after]
            .iter()
            .any(|d| store.stats_path("gpu-box-1", *d).exists());
        assert!(written);
        assert!(!store
            .stats_path("gpu-box-1", late.captured_at.date_naive())
            .exists());
    }

    #[test]
    fn test_names_with_commas_stay_one_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let mut odd = gpu(0, vec![]);
        odd.name = "NVIDIA H100 80GB HBM3, MIG 1g.10gb".to_string();
        store.store_on(&snapshot(vec![odd]), day()).unwrap();

        let mut reader = csv::Reader::from_path(store.stats_path("gpu-box-1", day())).unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.len(), 13);
        assert_eq!(&record[2], "NVIDIA H100 80GB HBM3, MIG 1g.10gb");
    }

    #[test]
    fn test_empty_snapshot_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();

        let receipt = store.store_on(&snapshot(vec![]), day()).unwrap();
        assert_eq!(receipt, StoreReceipt::default());
        assert!(store.server_dir("gpu-box-1").is_dir());
        assert!(!store.stats_path("gpu-box-1", day()).exists());
    }

    #[test]
    fn test_io_failure_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path()).unwrap();
        // a plain file where the server directory should go
        fs::write(store.server_dir("gpu-box-1"), b"not a directory").unwrap();

        assert!(!store.store(&snapshot(vec![gpu(0, vec![])])));
        assert!(matches!(
            store.try_store(&snapshot(vec![gpu(0, vec![])])),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path()).unwrap());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..25 {
                        store
                            .store_on(&snapshot(vec![gpu(0, vec![]), gpu(1, vec![])]), day())
                            .unwrap();
                    }
                });
            }
        });

        let rows = lines(&store.stats_path("gpu-box-1", day()));
        assert_eq!(rows.len(), 1 + 4 * 25 * 2);
        assert_eq!(rows.iter().filter(|l| l.as_str() == STATS_HEADER).count(), 1);
        assert!(rows.iter().all(|l| l.split(',').count() == 13));
    }
}

//! `nvidia-smi` queries and the parser for their CSV output
//!
//! All three queries use `--format=csv,noheader,nounits`, so every line is a
//! bare comma-separated row. Parsing is pure: no I/O, no state.

use std::collections::HashMap;

use tracing::warn;

use crate::error::ParseError;
use crate::gpu::{GpuRecord, ProcessRecord, UNKNOWN_UUID};

pub const STATS_QUERY: &str = "nvidia-smi --query-gpu=index,name,utilization.gpu,utilization.memory,memory.total,memory.used,memory.free,temperature.gpu,power.draw,power.limit,fan.speed --format=csv,noheader,nounits";

pub const UUID_QUERY: &str = "nvidia-smi --query-gpu=index,uuid --format=csv,noheader,nounits";

pub const PROCESS_QUERY: &str = "nvidia-smi --query-compute-apps=pid,process_name,gpu_uuid,used_memory --format=csv,noheader,nounits";

const STATS_FIELDS: usize = 11;
const UUID_FIELDS: usize = 2;
const PROCESS_FIELDS: usize = 4;

/// Parse the three query outputs into GPU records with their processes
/// attached.
///
/// Records keep the order of `stats`. Rows that are short or carry a
/// non-numeric value in a numeric column are skipped; the remaining rows
/// still parse. A process whose `gpu_uuid` matches no GPU is dropped.
pub fn parse_gpu_stats(stats: &str, uuids: &str, processes: &str) -> Vec<GpuRecord> {
    let uuid_map = parse_uuid_map(uuids);

    let mut gpus: Vec<GpuRecord> = rows(stats)
        .filter_map(|line| match parse_gpu_row(line, &uuid_map) {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                warn!(line, error = %e, "Skipping GPU stats row");
                None
            }
        })
        .collect();

    for line in rows(processes) {
        let process = match parse_process_row(line) {
            Ok(process) => process,
            Err(e) => {
                warn!(line, error = %e, "Skipping process row");
                continue;
            }
        };

        match gpus.iter_mut().find(|gpu| gpu.uuid == process.gpu_uuid) {
            Some(gpu) => gpu.processes.push(process),
            None => tracing::debug!(pid = process.pid, uuid = %process.gpu_uuid, "Process on unknown GPU dropped"),
        }
    }

    gpus
}

fn rows(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|line| !line.is_empty())
}

fn split_fields(line: &str, expected: usize) -> Result<Vec<&str>, ParseError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < expected {
        return Err(ParseError::TooFewFields {
            expected,
            found: fields.len(),
        });
    }
    Ok(fields)
}

fn parse_uuid_map(output: &str) -> HashMap<String, String> {
    rows(output)
        .filter_map(|line| split_fields(line, UUID_FIELDS).ok())
        .map(|fields| (fields[0].to_string(), fields[1].to_string()))
        .collect()
}

fn parse_gpu_row(line: &str, uuids: &HashMap<String, String>) -> Result<GpuRecord, ParseError> {
    let f = split_fields(line, STATS_FIELDS)?;

    let uuid = uuids
        .get(f[0])
        .cloned()
        .unwrap_or_else(|| UNKNOWN_UUID.to_string());

    Ok(GpuRecord {
        index: integer("index", f[0])?,
        name: f[1].to_string(),
        uuid,
        utilization_gpu_pct: number("utilization.gpu", f[2])?,
        utilization_mem_pct: number("utilization.memory", f[3])?,
        memory_total_mb: number("memory.total", f[4])?,
        memory_used_mb: number("memory.used", f[5])?,
        memory_free_mb: number("memory.free", f[6])?,
        temperature_c: number("temperature.gpu", f[7])?,
        power_draw_w: number("power.draw", f[8])?,
        power_limit_w: number("power.limit", f[9])?,
        fan_speed_pct: fan_speed(f[10])?,
        processes: Vec::new(),
    })
}

fn parse_process_row(line: &str) -> Result<ProcessRecord, ParseError> {
    let f = split_fields(line, PROCESS_FIELDS)?;

    Ok(ProcessRecord {
        pid: integer("pid", f[0])?,
        name: f[1].to_string(),
        gpu_uuid: f[2].to_string(),
        used_memory_mb: number("used_memory", f[3])?,
    })
}

fn integer(field: &'static str, value: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn number(field: &'static str, value: &str) -> Result<f64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Passively cooled boards report no fan: an empty field or a placeholder
/// such as `[N/A]` / `[Not Supported]` reads as 0.
fn fan_speed(value: &str) -> Result<f64, ParseError> {
    if value.is_empty() || value.starts_with('[') {
        return Ok(0.0);
    }
    number("fan.speed", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "\
0, NVIDIA A100-SXM4-40GB, 87, 41, 40960, 30000, 10960, 61, 250.31, 400.00, 0
1, NVIDIA A100-SXM4-40GB, 3, 0, 40960, 4, 40956, 33, 52.10, 400.00, 0
";

    const UUIDS: &str = "\
0, GPU-aaaa
1, GPU-bbbb
";

    #[test]
    fn test_order_follows_stats_output() {
        let gpus = parse_gpu_stats(STATS, "1, GPU-bbbb\n0, GPU-aaaa", "");
        let indices: Vec<u32> = gpus.iter().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(gpus[0].uuid, "GPU-aaaa");
        assert_eq!(gpus[1].uuid, "GPU-bbbb");
        assert_eq!(gpus[0].power_draw_w, 250.31);
        assert_eq!(gpus[1].memory_free_mb, 40956.0);
    }

    #[test]
    fn test_empty_process_output() {
        let gpus = parse_gpu_stats(STATS, UUIDS, "");
        assert_eq!(gpus.len(), 2);
        assert!(gpus.iter().all(|g| g.processes.is_empty()));
    }

    #[test]
    fn test_processes_attach_by_uuid() {
        let processes = "\
4242, python, GPU-bbbb, 1024
4243, /usr/bin/trainer, GPU-aaaa, 29000
4244, python, GPU-bbbb, 2048
";
        let gpus = parse_gpu_stats(STATS, UUIDS, processes);

        let pids: Vec<u32> = gpus[1].processes.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![4242, 4244]);
        assert_eq!(gpus[0].processes.len(), 1);
        assert_eq!(gpus[0].processes[0].name, "/usr/bin/trainer");
        assert_eq!(gpus[0].processes[0].used_memory_mb, 29000.0);
    }

    #[test]
    fn test_short_stats_row_skipped() {
        let stats = "\
0, Tesla T4, 10, 5, 15360, 2000, 13360, 45, 20.5, 70
1, Tesla T4, 12, 6, 15360, 2100, 13260, 47, 21.0, 70, 30
";
        let gpus = parse_gpu_stats(stats, "1, GPU-t4", "");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 1);
        assert_eq!(gpus[0].fan_speed_pct, 30.0);
    }

    #[test]
    fn test_unmatched_process_dropped() {
        let processes = "\
100, python, GPU-aaaa, 512
101, python, GPU-gone, 512
102, short-row
";
        let gpus = parse_gpu_stats(STATS, UUIDS, processes);
        let attached: usize = gpus.iter().map(|g| g.processes.len()).sum();
        assert_eq!(attached, 1);
        assert!(attached < processes.lines().count());
    }

    #[test]
    fn test_missing_uuid_is_unknown() {
        let gpus = parse_gpu_stats(STATS, "0, GPU-aaaa", "9, python, unknown, 1");
        assert_eq!(gpus[1].uuid, UNKNOWN_UUID);
        // processes are matched by uuid, and "unknown" is a uuid like any other
        assert_eq!(gpus[1].processes.len(), 1);
    }

    #[test]
    fn test_fan_speed_placeholders() {
        let stats = "\
0, Tesla V100, 1, 1, 16160, 0, 16160, 30, 25.0, 300.0,
1, Tesla V100, 1, 1, 16160, 0, 16160, 30, 25.0, 300.0, [N/A]
2, Tesla V100, 1, 1, 16160, 0, 16160, 30, 25.0, 300.0, [Not Supported]
";
        let gpus = parse_gpu_stats(stats, "", "");
        assert_eq!(gpus.len(), 3);
        assert!(gpus.iter().all(|g| g.fan_speed_pct == 0.0));
    }

    #[test]
    fn test_non_numeric_row_is_skipped() {
        let stats = "\
0, RTX 4090, 10, 5, 24564, 2000, 22564, 45, [N/A], 450, 30
1, RTX 4090, 11, 6, 24564, 2100, 22464, 46, 120.5, 450, 31
x, RTX 4090, 11, 6, 24564, 2100, 22464, 46, 120.5, 450, 31
";
        let gpus = parse_gpu_stats(stats, "", "");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 1);

        let err = parse_gpu_row(stats.lines().next().unwrap(), &HashMap::new()).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                field: "power.draw",
                value: "[N/A]".to_string()
            }
        );
    }

    #[test]
    fn test_bad_pid_skips_only_that_process() {
        let processes = "\
abc, python, GPU-aaaa, 10
7, python, GPU-aaaa, 10
";
        let gpus = parse_gpu_stats(STATS, UUIDS, processes);
        assert_eq!(gpus[0].processes.len(), 1);
        assert_eq!(gpus[0].processes[0].pid, 7);
    }

    #[test]
    fn test_sample_blobs() {
        let gpus = parse_gpu_stats(
            "0, TestGPU, 10, 5, 8000, 2000, 6000, 45, 20.5, 70, 30",
            "0, GPU-abc",
            "123, python, GPU-abc, 512",
        );
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].uuid, "GPU-abc");
        assert_eq!(
            gpus[0].processes,
            vec![ProcessRecord {
                pid: 123,
                name: "python".to_string(),
                gpu_uuid: "GPU-abc".to_string(),
                used_memory_mb: 512.0,
            }]
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gpustat_core::GpuStatConfig;
use gpustat_services::{Collector, CollectorError, CollectorExit, Fleet, Snapshot, Store};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpustat")]
#[command(about = "gpustat - NVIDIA GPU monitoring for remote machines over SSH", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "GPUSTAT_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured server and append results to the data directory
    Run {
        /// Overrides settings.data_dir
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Poll each server once and print the result without storing it
    Probe {
        /// Only probe this server
        #[arg(short, long)]
        server: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Validate the config file and list the resolved servers
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = GpuStatConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { data_dir } => cmd_run(config, data_dir).await?,
        Commands::Probe { server, output } => cmd_probe(&config, server.as_deref(), output).await?,
        Commands::CheckConfig => cmd_check_config(&config),
    }

    Ok(())
}

async fn cmd_run(mut config: GpuStatConfig, data_dir: Option<PathBuf>) -> Result<()> {
    if let Some(dir) = data_dir {
        config.settings.data_dir = dir;
    }

    let store = Store::new(&config.settings.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.settings.data_dir.display()
        )
    })?;
    let fleet = Fleet::from_config(&config, Arc::new(store));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutting down gracefully");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    tracing::info!(
        servers = fleet.targets().len(),
        data_dir = %config.settings.data_dir.display(),
        "gpustat starting"
    );

    let reports = fleet.run(cancel).await;

    println!();
    for report in &reports {
        println!("  {:<24} {}", report.server, report.exit);
    }

    let gave_up = reports
        .iter()
        .filter(|r| matches!(r.exit, CollectorExit::GaveUp { .. }))
        .count();
    if gave_up > 0 {
        tracing::warn!("{} of {} collectors gave up", gave_up, reports.len());
    }

    Ok(())
}

async fn cmd_probe(config: &GpuStatConfig, server: Option<&str>, output: OutputFormat) -> Result<()> {
    let targets: Vec<_> = config
        .targets()
        .into_iter()
        .filter(|t| server.map_or(true, |name| t.name == name))
        .collect();

    if targets.is_empty() {
        bail!("No server named '{}' in config", server.unwrap_or_default());
    }

    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let name = target.name.clone();
        let mut collector = Collector::over_ssh(target, &config.settings);
        let result = collector.poll_once().await;
        collector.disconnect().await;
        results.push((name, result));
    }

    match output {
        OutputFormat::Table => results.iter().for_each(|(name, r)| print_table(name, r)),
        OutputFormat::Json => print_json(&results)?,
    }

    Ok(())
}

fn print_table(name: &str, result: &Result<Snapshot, CollectorError>) {
    println!();
    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(e) => {
            println!("  {}: {}", name, e);
            return;
        }
    };

    println!(
        "  {} ({}) at {}",
        snapshot.server_name,
        snapshot.host,
        snapshot.timestamp()
    );
    if snapshot.gpus.is_empty() {
        println!("  No GPUs reported");
        return;
    }

    println!(
        "  {:<4} {:<28} {:>6} {:>18} {:>6} {:>16} {:>6} {:>6}",
        "IDX", "NAME", "UTIL", "MEMORY (MB)", "TEMP", "POWER (W)", "FAN", "PROCS"
    );
    for gpu in &snapshot.gpus {
        println!(
            "  {:<4} {:<28} {:>5.0}% {:>18} {:>5.0}C {:>16} {:>5.0}% {:>6}",
            gpu.index,
            gpu.name,
            gpu.utilization_gpu_pct,
            format!("{:.0}/{:.0}", gpu.memory_used_mb, gpu.memory_total_mb),
            gpu.temperature_c,
            format!("{:.1}/{:.1}", gpu.power_draw_w, gpu.power_limit_w),
            gpu.fan_speed_pct,
            gpu.process_count(),
        );
        for process in &gpu.processes {
            println!(
                "         pid {:<8} {:<32} {:.0} MB",
                process.pid, process.name, process.used_memory_mb
            );
        }
    }
}

fn print_json(results: &[(String, Result<Snapshot, CollectorError>)]) -> Result<()> {
    let values = results
        .iter()
        .map(|(name, result)| match result {
            Ok(snapshot) => serde_json::to_value(snapshot),
            Err(e) => Ok(serde_json::json!({ "server_name": name, "error": e.to_string() })),
        })
        .collect::<serde_json::Result<Vec<_>>>()?;

    println!("{}", serde_json::to_string_pretty(&values)?);
    Ok(())
}

fn cmd_check_config(config: &GpuStatConfig) {
    println!();
    println!("  Data directory:  {}", config.settings.data_dir.display());
    println!("  Max retries:     {}", config.settings.max_retries);
    println!("  Connect timeout: {}s", config.settings.connect_timeout_secs);
    println!();

    for target in config.targets() {
        let key_note = if target.key_path.exists() {
            ""
        } else {
            "  (key file not found)"
        };
        println!(
            "  {:<24} {}@{}:{}  every {}s  key {}{}",
            target.name,
            target.user,
            target.host,
            target.port,
            target.poll_interval.as_secs(),
            target.key_path.display(),
            key_note
        );
    }
    println!();
}

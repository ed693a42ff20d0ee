#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use cfs_buf::set_buffer_unit;
use cfs_disk::{DiskManager, ThreadAioBackend};
use cfs_meta::record::LogRecord;
use cfs_meta::tree::TreeSummary;
use cfs_meta::{CheckpointWriter, Restorer, StartupConfig, startup};
use cfs_rt::TickDriver;
use cfs_types::BufferUnit;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "chunkfs-meta", about = "ChunkFS metadata server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover from checkpoint + logs and run the metadata server.
    Run {
        /// Directory holding operation logs.
        #[arg(long)]
        logdir: PathBuf,
        /// Directory holding checkpoints.
        #[arg(long)]
        cpdir: PathBuf,
        /// Chunk servers required before client traffic is admitted.
        #[arg(long, default_value_t = 1)]
        min_chunkservers: u32,
        /// Scatter/gather allocation unit in bytes.
        #[arg(long, default_value_t = 4096)]
        buffer_unit: usize,
        /// Event-loop tick interval in milliseconds.
        #[arg(long, default_value_t = 100)]
        tick_interval_ms: u64,
        /// Seconds between background checkpoints.
        #[arg(long, default_value_t = 600)]
        checkpoint_interval_secs: u64,
        /// I/O threads backing the disk manager.
        #[arg(long, default_value_t = 2)]
        io_threads: usize,
    },
    /// Parse a checkpoint file and summarize the tree it restores.
    InspectCheckpoint {
        /// Path to the `chkpt.<seq>` file.
        checkpoint: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Scan an operation-log file and summarize its records.
    InspectLog {
        /// Path to the `log.<n>` file.
        log: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CheckpointReport {
    path: String,
    summary: TreeSummary,
}

#[derive(Debug, Serialize)]
struct LogReport {
    path: String,
    records: u64,
    first_seq: Option<u64>,
    last_seq: Option<u64>,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            logdir,
            cpdir,
            min_chunkservers,
            buffer_unit,
            tick_interval_ms,
            checkpoint_interval_secs,
            io_threads,
        } => serve(
            logdir,
            cpdir,
            min_chunkservers,
            buffer_unit,
            tick_interval_ms,
            checkpoint_interval_secs,
            io_threads,
        ),
        Command::InspectCheckpoint { checkpoint, json } => inspect_checkpoint(&checkpoint, json),
        Command::InspectLog { log, json } => inspect_log(&log, json),
    }
}

#[allow(clippy::too_many_arguments)]
fn serve(
    logdir: PathBuf,
    cpdir: PathBuf,
    min_chunkservers: u32,
    buffer_unit: usize,
    tick_interval_ms: u64,
    checkpoint_interval_secs: u64,
    io_threads: usize,
) -> Result<()> {
    let unit = BufferUnit::new(buffer_unit)
        .map_err(|err| anyhow::anyhow!("bad --buffer-unit: {err}"))?;
    if !set_buffer_unit(unit) {
        warn!(event = "buffer_unit_already_set", requested = buffer_unit);
    }

    let state = startup(&StartupConfig {
        logdir,
        cpdir: cpdir.clone(),
        min_chunkservers,
    })
    .context("metadata-server startup failed")?;

    if !state.gate.is_ready() {
        info!(
            event = "recovery_gate_waiting",
            required = min_chunkservers,
            "client traffic blocked until chunk servers register"
        );
    }

    let driver = TickDriver::new();
    let backend = ThreadAioBackend::new(io_threads).context("failed to start disk I/O workers")?;
    let manager = DiskManager::new(backend);
    driver.register(manager);

    let checkpointer = CheckpointWriter::start(Arc::clone(&state.tree), cpdir)
        .context("failed to start checkpoint writer")?;

    info!(
        event = "server_running",
        tick_interval_ms,
        checkpoint_interval_secs
    );

    let tick = Duration::from_millis(tick_interval_ms.max(1));
    let cp_every = Duration::from_secs(checkpoint_interval_secs.max(1));
    let mut last_cp = std::time::Instant::now();
    loop {
        driver.run_tick();
        if last_cp.elapsed() >= cp_every {
            checkpointer.request_checkpoint();
            last_cp = std::time::Instant::now();
        }
        std::thread::sleep(tick);
    }
}

fn inspect_checkpoint(path: &PathBuf, json: bool) -> Result<()> {
    let tree = Restorer::rebuild(path)
        .with_context(|| format!("failed to restore {}", path.display()))?;
    let report = CheckpointReport {
        path: path.display().to_string(),
        summary: tree.summary(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let s = report.summary;
        println!("checkpoint: {}", report.path);
        println!("  applied seq:      {}", s.applied_seq);
        println!("  nodes:            {}", s.nodes);
        println!("  dentries:         {}", s.dentries);
        println!("  chunks:           {}", s.chunks);
        println!("  chunkVersionInc:  {}", s.chunk_version_inc);
    }
    Ok(())
}

fn inspect_log(path: &PathBuf, json: bool) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut records = 0_u64;
    let mut first_seq = None;
    let mut last_seq = None;
    for (idx, line) in contents.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let parsed = LogRecord::parse(line, idx as u64 + 1)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        if let Some((seq, _)) = parsed {
            records += 1;
            if first_seq.is_none() {
                first_seq = Some(seq.0);
            }
            last_seq = Some(seq.0);
        }
    }
    let report = LogReport {
        path: path.display().to_string(),
        records,
        first_seq,
        last_seq,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("log: {}", report.path);
        println!("  records:   {}", report.records);
        println!(
            "  seq range: {}..={}",
            report.first_seq.unwrap_or(0),
            report.last_seq.unwrap_or(0)
        );
    }
    Ok(())
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! thl: inspect and maintain a THL log directory.
//!
//! Subcommands:
//! - `info`: seqno range, segment count and settings
//! - `index`: one line per segment with its seqno range
//! - `list`: print events in a seqno range
//! - `purge`: delete events from either end of the log
//! - `validate`: check the index and every record's checksum

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use thl_log::{DiskLog, DiskLogConfig, ReplEvent, ThlEvent, FIRST};

/// Version string, pulled from Cargo.toml at compile time.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "thl", version = VERSION, about = "Inspect and maintain THL log directories")]
struct Cli {
    /// Log directory.
    #[arg(long, global = true, env = "THL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// JSON config file. `--log-dir` overrides its `log_dir`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the seqno range, segment count and settings.
    Info,
    /// List segments with their seqno ranges.
    Index,
    /// Print events from LOW to HIGH inclusive.
    List {
        #[arg(long)]
        low: Option<i64>,
        #[arg(long)]
        high: Option<i64>,
        /// Print headers only.
        #[arg(long)]
        headers: bool,
    },
    /// Delete events from LOW to HIGH. The range must include the first or
    /// last seqno in the log.
    Purge {
        #[arg(long)]
        low: Option<i64>,
        #[arg(long)]
        high: Option<i64>,
        /// Required to actually delete.
        #[arg(long)]
        yes: bool,
    },
    /// Check segment ranges and read every record.
    Validate,
}

impl Cli {
    fn log_config(&self, read_only: bool) -> Result<DiskLogConfig> {
        let mut config = match &self.config {
            Some(path) => DiskLogConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => DiskLogConfig::default(),
        };
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if config.log_dir.as_os_str().is_empty() {
            bail!("no log directory; pass --log-dir or set THL_LOG_DIR");
        }
        Ok(config.with_read_only(read_only))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("thl: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Info => info_cmd(cli),
        Command::Index => index_cmd(cli),
        Command::List { low, high, headers } => list_cmd(cli, *low, *high, *headers),
        Command::Purge { low, high, yes } => purge_cmd(cli, *low, *high, *yes),
        Command::Validate => validate_cmd(cli),
    }
}

fn open(cli: &Cli, read_only: bool) -> Result<DiskLog> {
    let config = cli.log_config(read_only)?;
    let dir = config.log_dir.display().to_string();
    DiskLog::prepare(config).with_context(|| format!("opening THL log in {dir}"))
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn info_cmd(cli: &Cli) -> Result<()> {
    let log = open(cli, true)?;
    let config = log.config();
    if cli.json {
        let value = json!({
            "log_dir": config.log_dir,
            "min_seqno": log.get_min_seqno(),
            "max_seqno": log.get_max_seqno(),
            "segments": log.file_count(),
            "log_file_size": config.log_file_size,
            "serializer": config.serializer,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Log directory: {}", config.log_dir.display());
        println!("Min seqno:     {}", log.get_min_seqno());
        println!("Max seqno:     {}", log.get_max_seqno());
        println!("Segments:      {}", log.file_count());
        println!("Segment size:  {} bytes", config.log_file_size);
        println!("Serializer:    {}", config.serializer);
    }
    Ok(())
}

fn index_cmd(cli: &Cli) -> Result<()> {
    let log = open(cli, true)?;
    let entries = log.index_entries();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in entries {
        println!("{entry}");
    }
    Ok(())
}

fn list_cmd(cli: &Cli, low: Option<i64>, high: Option<i64>, headers: bool) -> Result<()> {
    let log = open(cli, true)?;
    let low = low.unwrap_or_else(|| log.get_min_seqno().max(FIRST));
    let high = high.unwrap_or_else(|| log.get_max_seqno());
    if low > high {
        debug!(low, high, "Empty range");
        return Ok(());
    }

    let mut conn = log.create_connection(true)?;
    if headers {
        conn.set_read_filter(|_| false);
    }
    if !conn.seek(low, 0)? {
        bail!("seqno {low} is not in the log");
    }
    while let Some(event) = conn.next(false)? {
        if event.seqno > high {
            break;
        }
        if cli.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
    }
    Ok(())
}

fn print_event(event: &ThlEvent) {
    println!(
        "SEQ# = {} / FRAG# = {}{}",
        event.seqno,
        event.fragno,
        if event.last_frag { " (last frag)" } else { "" }
    );
    println!("- TIME = {}", event.source_tstamp.to_rfc3339());
    println!("- EPOCH# = {}", event.epoch);
    println!("- EVENTID = {}", event.event_id);
    println!("- SOURCEID = {}", event.source_id);
    if !event.shard_id.is_empty() {
        println!("- SHARDID = {}", event.shard_id);
    }
    match &event.event {
        Some(ReplEvent::Data { metadata, payload }) => {
            for (key, value) in metadata {
                println!("- METADATA {key} = {value}");
            }
            println!("- PAYLOAD = {}", String::from_utf8_lossy(payload));
        }
        Some(ReplEvent::Filtered {
            seqno_end,
            fragno_end,
        }) => println!("- FILTERED THROUGH = {seqno_end}/{fragno_end}"),
        None => {}
    }
}

fn purge_cmd(cli: &Cli, low: Option<i64>, high: Option<i64>, yes: bool) -> Result<()> {
    let log = open(cli, false)?;
    let (min, max) = (log.get_min_seqno(), log.get_max_seqno());
    let range = format!(
        "{} to {}",
        low.unwrap_or(min),
        high.unwrap_or(max)
    );
    if !yes {
        println!("Would delete seqnos {range} (log holds {min} to {max}); rerun with --yes");
        return Ok(());
    }
    log.delete(low, high)
        .with_context(|| format!("deleting seqnos {range}"))?;
    info!(range = %range, "Purged THL events");
    if cli.json {
        let value = json!({
            "deleted": range,
            "min_seqno": log.get_min_seqno(),
            "max_seqno": log.get_max_seqno(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "Deleted seqnos {range}; log now holds {} to {}",
            log.get_min_seqno(),
            log.get_max_seqno()
        );
    }
    Ok(())
}

fn validate_cmd(cli: &Cli) -> Result<()> {
    let log = open(cli, true)?;
    log.validate().context("index check failed")?;

    let mut conn = log.create_connection(true)?;
    conn.set_read_filter(|_| false);
    let mut events = 0u64;
    let mut last: Option<(i64, i16)> = None;
    if conn.seek(FIRST, 0)? {
        while let Some(event) = conn.next(false)? {
            let at = (event.seqno, event.fragno);
            if let Some(previous) = last {
                if at <= previous {
                    bail!(
                        "out-of-order event {}/{} after {}/{}",
                        at.0,
                        at.1,
                        previous.0,
                        previous.1
                    );
                }
            }
            last = Some(at);
            events += 1;
        }
    }

    if cli.json {
        let value = json!({ "valid": true, "segments": log.file_count(), "events": events });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "OK: {} segments, {} event fragments, seqnos {} to {}",
            log.file_count(),
            events,
            log.get_min_seqno(),
            log.get_max_seqno()
        );
    }
    Ok(())
}

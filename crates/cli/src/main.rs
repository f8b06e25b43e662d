///! # CLI - Event Index Shell
///!
///! A REPL over the leveled event index. Events are appended to a small text
///! log (`events.log`) and indexed by stream and event number; the index is
///! rebuilt from the log whenever it is missing, behind, or corrupt.
///!
///! ## Commands
///!
///! ```text
///! ADD stream number        Append an event and index it
///! DELETE stream            Delete a stream (entries vanish on merge/scavenge)
///! GET stream number        Log position of one event (or "(nil)")
///! LAST stream              Latest event of a stream
///! RANGE stream from to     Events numbered from..=to
///! FLUSH                    Dump the memtable to a table
///! MERGE                    Manually merge tables past the auto-merge level
///! SCAVENGE                 Drop entries of deleted events from every table
///! STATS                    Print index counters
///! EXIT / QUIT              Shut down gracefully
///! ```
///!
///! ## Configuration
///!
///! Index settings come from `ESIDX_*` environment variables (see
///! `IndexConfig::from_env`). The event log lives at `ESIDX_EVENT_LOG`
///! (default: "events.log"). Logging is controlled by `RUST_LOG`.
///!
///! ## Example
///!
///! ```text
///! $ cargo run -p cli
///! index ready (dir=data/index, commit=-1, replayed=0)
///! > ADD orders 0
///! OK 0
///! > GET orders 0
///! 0
///! > EXIT
///! bye
///! ```

mod event_log;

use anyhow::{Context, Result};
use event_log::EventLog;
use config::IndexConfig;
use index::{IndexEntry, IndexKey, LogReader, TableIndex};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

/// Events replayed into the index per batch on startup.
const REPLAY_BATCH: usize = 1024;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = IndexConfig::from_env().context("reading index configuration")?;
    let log_path = env_or("ESIDX_EVENT_LOG", "events.log");
    let log = Arc::new(EventLog::open(Path::new(&log_path))?);

    let index = TableIndex::open(
        config.clone(),
        Arc::clone(&log) as Arc<dyn LogReader>,
        log.end_position(),
    )?;
    let recovered_commit = index.commit_checkpoint();
    let replayed = replay(&index, &log)?;

    println!(
        "index ready (dir={}, commit={}, replayed={})",
        config.index_dir.display(),
        recovered_commit,
        replayed
    );
    println!("Commands: ADD stream n | DELETE stream | GET stream n | LAST stream | RANGE stream from to");
    println!("          FLUSH | MERGE | SCAVENGE | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some((cmd, args)) = parts.split_first() {
            let cmd = cmd.to_uppercase();
            if cmd == "EXIT" || cmd == "QUIT" {
                break;
            }
            if let Err(e) = execute(&index, &log, &cmd, args) {
                println!("ERR {:#}", e);
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    index.close(false)?;
    println!("bye");
    Ok(())
}

/// Indexes every logged event the index does not cover yet.
fn replay(index: &TableIndex, log: &EventLog) -> Result<usize> {
    let events = log.events_after(index.commit_checkpoint());
    for batch in events.chunks(REPLAY_BATCH) {
        let keys: Vec<IndexKey<'_>> = batch
            .iter()
            .map(|e| IndexKey {
                stream: &e.stream,
                event_number: e.number,
                position: e.position,
            })
            .collect();
        let commit = batch.last().map_or(0, |e| e.position);
        index.add_entries(commit, &keys)?;
    }
    if !events.is_empty() {
        tracing::info!(events = events.len(), "replayed log into index");
    }
    Ok(events.len())
}

fn execute(index: &TableIndex, log: &EventLog, cmd: &str, args: &[&str]) -> Result<()> {
    match (cmd, args) {
        ("ADD", [stream, number]) => {
            let number: i64 = number.parse().context("event number")?;
            let position = log.append_event(stream, number)?;
            index.add(position, stream, number, position)?;
            println!("OK {}", position);
        }
        ("DELETE", [stream]) => {
            log.append_delete(stream)?;
            println!("OK");
        }
        ("GET", [stream, number]) => {
            let number: i64 = number.parse().context("event number")?;
            match index.try_get_one_value(stream, number)? {
                Some(position) if log.exists_at(position) => println!("{}", position),
                _ => println!("(nil)"),
            }
        }
        ("LAST", [stream]) => match index.try_get_latest_entry(stream)? {
            Some(e) if !log.is_deleted(stream, e.log_position) => {
                println!("{} -> {}", e.event_number, e.log_position)
            }
            _ => println!("(nil)"),
        },
        ("RANGE", [stream, from, to]) => {
            let from: i64 = from.parse().context("range start")?;
            let to: i64 = to.parse().context("range end")?;
            let entries: Vec<_> = index
                .get_range(stream, from, to)?
                .into_iter()
                .filter(|e| log.exists_at(e.log_position))
                .collect();
            if entries.is_empty() {
                println!("(empty)");
            } else {
                for e in &entries {
                    println!("{} -> {}", e.event_number, e.log_position);
                }
                println!("({} entries)", entries.len());
            }
        }
        ("FLUSH", []) => {
            let flushed = index.flush()?;
            println!(
                "OK ({}, levels={:?})",
                if flushed { "flushed" } else { "nothing to flush" },
                index.stats().level_sizes
            );
        }
        ("MERGE", []) => {
            let merged = index.merge_indexes()?;
            println!(
                "OK ({}, levels={:?})",
                if merged { "merged" } else { "nothing to merge" },
                index.stats().level_sizes
            );
        }
        ("SCAVENGE", []) => {
            let removed = index.scavenge(&|e: &IndexEntry| log.exists_at(e.log_position))?;
            println!("OK (removed {})", removed);
        }
        ("STATS", []) => {
            let s = index.stats();
            println!(
                "memtable={} tables={} levels={:?} prepare={} commit={}",
                s.memtable_entries,
                s.table_count,
                s.level_sizes,
                s.prepare_checkpoint,
                s.commit_checkpoint
            );
        }
        _ => println!("unknown command or wrong arguments: {} {}", cmd, args.join(" ")),
    }
    Ok(())
}

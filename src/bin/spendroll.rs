use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use spendroll::export::write_json;
use spendroll::{AggregationEngine, EngineConfig, JsonLinesSink, RawEvent, ShardedIngest};

#[derive(Parser, Debug)]
#[command(name = "spendroll")]
#[command(about = "Compute rolling 30-day spend features from a JSONL transaction feed")]
struct Cli {
    /// Input JSONL feed, one event per line ("-" for stdin)
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Engine config (JSON); missing fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override worker thread count
    #[arg(long)]
    workers: Option<usize>,

    /// Override retention window length in days
    #[arg(long)]
    window_days: Option<u32>,

    /// Write every applied snapshot as JSONL (suffixed per worker when sharded)
    #[arg(long)]
    snapshots: Option<PathBuf>,

    /// Write the final engine state as JSON
    #[arg(long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(days) = cli.window_days {
        config.window_days = days;
    }
    let workers = config.workers;
    let engine = Arc::new(AggregationEngine::new(config).context("invalid engine config")?);
    info!("Input: {}", cli.input);
    info!("Workers: {}", workers);

    let reader = open_input(&cli.input)?;
    let undecodable = Cell::new(0_u64);
    let events = decode_lines(reader, &undecodable);

    let outcomes = match &cli.snapshots {
        Some(base) => {
            let shards = ShardedIngest::from_config(Arc::clone(&engine));
            let mut sinks = Vec::with_capacity(shards.worker_count());
            for worker_id in 0..shards.worker_count() {
                let path = snapshot_path(base, worker_id, shards.worker_count());
                let file = File::create(&path)
                    .with_context(|| format!("create snapshot stream {}", path.display()))?;
                sinks.push(JsonLinesSink::new(BufWriter::new(file)));
            }
            let report = shards.run_with_sinks(events, sinks)?;
            let written: u64 = report.sinks.iter().map(|sink| sink.written()).sum();
            info!(
                "Published {} snapshots ({:.0} events/sec)",
                written,
                report.throughput()
            );
            report.outcomes()
        }
        None => {
            let report = ShardedIngest::from_config(Arc::clone(&engine))
                .run(events, |_| spendroll::LatestSnapshots::new())?;
            info!("Throughput: {:.0} events/sec", report.throughput());
            report.outcomes()
        }
    };

    info!(
        "applied={} duplicates={} non_transactional={} malformed={} undecodable={} customers={}",
        outcomes.applied,
        outcomes.duplicates,
        outcomes.non_transactional,
        outcomes.malformed,
        undecodable.get(),
        engine.store().customer_count()
    );

    if let Some(path) = &cli.export {
        write_json(path, &engine.export())
            .with_context(|| format!("write export {}", path.display()))?;
        info!("Export: {}", path.display());
    }

    println!(
        "applied={} duplicates={} non_transactional={} malformed={} customers={}",
        outcomes.applied,
        outcomes.duplicates,
        outcomes.non_transactional,
        outcomes.malformed + undecodable.get(),
        engine.store().customer_count()
    );

    Ok(())
}

fn open_input(input: &str) -> Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("open input {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

fn decode_lines<'a>(
    reader: Box<dyn BufRead>,
    undecodable: &'a Cell<u64>,
) -> impl Iterator<Item = RawEvent> + 'a {
    reader
        .lines()
        .enumerate()
        .filter_map(move |(idx, line)| {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("line {}: read failed: {}", idx + 1, err);
                    undecodable.set(undecodable.get() + 1);
                    return None;
                }
            };
            if line.trim().is_empty() {
                return None;
            }
            match RawEvent::from_json(&line) {
                Ok(raw) => Some(raw),
                Err(err) => {
                    warn!("line {}: {}", idx + 1, err);
                    undecodable.set(undecodable.get() + 1);
                    None
                }
            }
        })
}

fn snapshot_path(base: &Path, worker_id: usize, workers: usize) -> PathBuf {
    if workers <= 1 {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", worker_id));
    PathBuf::from(name)
}

//! CLI Entry Point for rust-evb
//!
//! Provides command-line tools around the event builder:
//! - `synth`: write a synthetic multi-source fragment file
//! - `replay`: stream a fragment file through the builder and report statistics
//! - `check-config`: load and validate a configuration file
//!
//! # Usage
//!
//! ```bash
//! rust_evb synth run.evb --sources 4 --fragments 10000 --barrier-every 2500
//! rust_evb replay run.evb --config config/evb.toml
//! rust_evb check-config config/evb.toml
//! ```

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_evb::config::{EvbConfig, DEFAULT_CONFIG_PATH};
use rust_evb::fragment::{whole_fragment_prefix, Fragment};
use rust_evb::handler::FragmentHandler;
use rust_evb::logging;
use rust_evb::output::OutputStage;
use rust_evb::service::{EvbService, ServiceSettings};
use rust_evb::statistics::{
    BarrierStatistics, DataLateStatistics, DuplicateTimestampStatistics, EventCounter,
    OutOfOrderStatistics,
};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust_evb")]
#[command(about = "Timestamp-ordering event builder tools", long_about = None)]
struct Cli {
    /// Configuration file (TOML); RUST_EVB_* environment variables override it
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic fragment file
    Synth {
        /// Output file
        output: PathBuf,

        /// Number of sources
        #[arg(long, default_value_t = 4)]
        sources: u32,

        /// Fragments per source
        #[arg(long, default_value_t = 1000)]
        fragments: u64,

        /// Payload bytes per fragment
        #[arg(long, default_value_t = 64)]
        payload_size: usize,

        /// Insert a barrier on every source after this many fragments (0 = never)
        #[arg(long, default_value_t = 0)]
        barrier_every: u64,

        /// Largest random step between a source's consecutive timestamps
        #[arg(long, default_value_t = 100)]
        max_step: u64,

        /// RNG seed
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },

    /// Stream a fragment file through the event builder
    Replay {
        /// Fragment file written by `synth` or a readout program
        input: PathBuf,

        /// Maximum bytes handed to the builder per batch
        #[arg(long, default_value_t = 64 * 1024)]
        chunk_size: usize,

        /// Register these source ids up front (comma-separated)
        #[arg(long, value_delimiter = ',')]
        sources: Vec<u32>,
    },

    /// Load and validate a configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EvbConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Synth {
            output,
            sources,
            fragments,
            payload_size,
            barrier_every,
            max_step,
            seed,
        } => {
            let spec = SynthSpec {
                sources,
                fragments,
                payload_size,
                barrier_every,
                max_step,
                seed,
            };
            synth(output, &spec)
        }
        Commands::Replay {
            input,
            chunk_size,
            sources,
        } => replay(&config, input, chunk_size, sources).await,
        Commands::CheckConfig => {
            println!("{} is valid", cli.config.display());
            println!("{config:#?}");
            Ok(())
        }
    }
}

struct SynthSpec {
    sources: u32,
    fragments: u64,
    payload_size: usize,
    barrier_every: u64,
    max_step: u64,
    seed: u64,
}

/// Interleave per-source streams the way readout would deliver them: each
/// source is internally ordered, sources advance at random relative rates.
fn synth(output: PathBuf, spec: &SynthSpec) -> Result<()> {
    anyhow::ensure!(spec.sources > 0, "--sources must be at least 1");
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut clocks = vec![0u64; spec.sources as usize];
    let mut emitted = vec![0u64; spec.sources as usize];
    let mut out = BytesMut::new();
    let mut total = 0u64;

    while emitted.iter().any(|&n| n < spec.fragments) {
        let index = rng.gen_range(0..clocks.len());
        if emitted[index] >= spec.fragments {
            continue;
        }
        let source_id = index as u32 + 1;

        emitted[index] += 1;
        clocks[index] += rng.gen_range(1..=spec.max_step.max(1));
        let payload: Vec<u8> = (0..spec.payload_size).map(|_| rng.gen()).collect();
        Fragment::try_new(clocks[index], source_id, 0, Bytes::from(payload))?.flatten_into(&mut out);
        total += 1;

        if spec.barrier_every > 0 && emitted[index] % spec.barrier_every == 0 {
            Fragment::new(clocks[index], source_id, 1, Bytes::new()).flatten_into(&mut out);
            total += 1;
        }
    }

    std::fs::write(&output, &out).with_context(|| format!("writing {}", output.display()))?;
    info!(
        path = %output.display(),
        fragments = total,
        bytes = out.len(),
        "Synthetic fragment file written"
    );
    Ok(())
}

async fn replay(
    config: &EvbConfig,
    input: PathBuf,
    chunk_size: usize,
    sources: Vec<u32>,
) -> Result<()> {
    let data = Bytes::from(
        std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?,
    );

    let counter = EventCounter::default();
    let mut stage = OutputStage::new();
    stage.add_observer(Box::new(counter.clone()));

    let duplicates = DuplicateTimestampStatistics::default();
    let barriers = BarrierStatistics::default();
    let late = DataLateStatistics::default();
    let out_of_order = OutOfOrderStatistics::default();

    let mut handler = FragmentHandler::new(config.builder.handler_settings());
    handler.add_duplicate_observer(Box::new(duplicates.clone()));
    handler.add_barrier_observer(Box::new(barriers.clone()));
    handler.add_partial_barrier_observer(Box::new(barriers.clone()));
    handler.add_data_late_observer(Box::new(late.clone()));
    handler.add_non_monotonic_observer(Box::new(out_of_order.clone()));
    handler.add_flow_control_observer(Box::new(XoffLogger));
    for &source_id in &sources {
        handler.create_source_queue("replay", source_id);
    }

    let handle = EvbService::spawn_with_output(handler, ServiceSettings::from(config), stage);

    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        let take = match whole_fragment_prefix(rest, chunk_size) {
            0 => rest.len(),
            n => n,
        };
        handle
            .add_fragments(data.slice(offset..offset + take))
            .await
            .with_context(|| format!("replaying {} at byte {offset}", input.display()))?;
        offset += take;
    }

    let stats = handle.shutdown().await?;
    let counts = counter.snapshot();

    println!("Replayed {} bytes from {}", data.len(), input.display());
    println!(
        "  output:        {} fragments in {} batches ({} barrier fragments)",
        counts.fragments, counts.batches, counts.barrier_fragments
    );
    println!("  left queued:   {}", stats.total_queued_fragments);
    println!("  duplicates:    {}", duplicates.snapshot().total);
    println!("  late data:     {}", late.snapshot().count);
    println!("  out of order:  {}", out_of_order.snapshot().total);
    let barrier_counts = barriers.snapshot();
    println!(
        "  barriers:      {} complete, {} partial",
        barrier_counts.complete, barrier_counts.partial
    );
    Ok(())
}

struct XoffLogger;

impl rust_evb::observers::FlowControlObserver for XoffLogger {
    fn xon(&mut self) {
        info!("Builder ready for more data");
    }

    fn xoff(&mut self) {
        warn!("Builder asked producers to pause");
    }
}

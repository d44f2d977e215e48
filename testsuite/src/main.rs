use anyhow::Context;
use clap::Parser;
use oxtdb::loader::{IndexBuildStrategy, LoadTarget, StatisticsOutcome};
use oxtdb::store::Store;
use oxtdb_testsuite::DatasetGenerator;
use std::path::PathBuf;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bulk loads a synthetic dataset and reports the load.
#[derive(Parser)]
#[clap(about, version)]
struct Args {
    /// Number of generated statements.
    #[clap(long, default_value_t = 100_000)]
    size: usize,
    #[clap(long, default_value_t = 42)]
    seed: u64,
    /// Number of named graphs. With 0 everything is loaded into the default graph.
    #[clap(long, default_value_t = 0)]
    graphs: usize,
    /// Strategy of the index phase: sequential, interleaved or parallel.
    #[clap(long, default_value_t = IndexBuildStrategy::Sequential)]
    strategy: IndexBuildStrategy,
    /// Directory of the store. An in-memory store is used if not set.
    #[clap(long)]
    location: Option<PathBuf>,
    /// Validates the store after the load.
    #[clap(long)]
    validate: bool,
    /// Keeps the secondary indexes attached during the load.
    #[clap(long)]
    incremental: bool,
    /// Does not collect the load statistics.
    #[clap(long)]
    no_stats: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let store = match &args.location {
        Some(location) => Store::open(location)
            .with_context(|| format!("failed to open the store in {}", location.display()))?,
        None => Store::new()?,
    };
    let quads = DatasetGenerator::new(args.seed)
        .with_graphs(args.graphs)
        .quads(args.size);
    let target = if args.graphs == 0 {
        LoadTarget::DefaultGraph
    } else {
        LoadTarget::Dataset
    };
    let mut session = store
        .bulk_loader()
        .with_target(target)
        .with_strategy(args.strategy)
        .with_incremental(args.incremental)
        .with_statistics(!args.no_stats)
        .start()?;
    session.add_all(&quads)?;
    let report = session.finish()?;

    if args.validate {
        store.validate().context("the loaded store is invalid")?;
    }
    if let StatisticsOutcome::Failed(e) = &report.statistics_outcome {
        info!(error = %e, "the statistics were not written");
    }
    println!(
        "{}: loaded {} statements ({} new) with the {} strategy in {:.2}s + {:.2}s",
        OffsetDateTime::now_utc().format(&Rfc3339)?,
        report.statements,
        report.tuples_added,
        report.strategy,
        report.data_phase.as_secs_f64(),
        report.index_phase.as_secs_f64()
    );
    for index in &report.indexes {
        println!("  {}: {} tuples", index.name, index.tuples);
    }
    Ok(())
}

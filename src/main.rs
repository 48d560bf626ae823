mod cli;

use {
  bgp_sentry::{dataset, node::orchestrator::Orchestrator},
  clap::Parser,
  cli::CliOpts,
  std::sync::Arc,
  tracing::{info, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn print_essentials(
  opts: &CliOpts,
  config: &bgp_sentry::config::Config,
) {
  info!("Starting BGP-Sentry audit run");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Dataset directory: {}", opts.dataset_dir().display());
  match opts.data_dir() {
    Some(dir) => info!("Data directory: {}", dir.display()),
    None => info!("Data directory: in-memory replicas"),
  }
  info!("Run seed: {}", config.seed);
  info!("Speed multiplier: {}", config.speed_multiplier);
  info!(
    "Consensus: T = max({}, min(N/3+1, {})), timeouts {:?}/{:?}",
    config.consensus_min,
    config.consensus_cap,
    config.regular_timeout,
    config.attack_timeout,
  );
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer().with_filter(filter_fn(
      move |metadata| {
        !metadata.target().starts_with("sled")
          && metadata.level() <= &loglevel
      },
    )))
    .init();

  let config = Arc::new(opts.config()?);
  print_essentials(&opts, &config);

  // dataset parse failures abort here, before any node runs
  let dataset = dataset::load(opts.dataset_dir())?;

  let orchestrator =
    Orchestrator::new(dataset, Arc::clone(&config), opts.data_dir())?;
  let stats = orchestrator.run().await?;

  for (asn, report) in &stats.nodes {
    if let (Some(height), Some(tip)) =
      (report.chain_height, &report.tip_hash)
    {
      info!(
        "{asn}: chain height {height}, tip {tip}, {} proposed, {} \
         skipped by dedup, {} faults",
        report.stats.proposed,
        report.stats.skipped_dedup,
        report.chain_faults,
      );
    }
  }
  info!(
    "bus: {} sent, {} delivered, {} dropped",
    stats.bus.sent, stats.bus.delivered, stats.bus.dropped
  );
  info!(
    "ledger: {:.0} in treasury, {:.0} distributed across {} accounts",
    stats.ledger.treasury,
    stats.ledger.total_supply - stats.ledger.treasury - stats.ledger.burned,
    stats.ledger.balances.len(),
  );

  // the full counter set the external result writers consume
  println!("{}", serde_json::to_string_pretty(&stats)?);

  Ok(())
}

//! Run composition and scheduling.
//!
//! The orchestrator is the composition root: it constructs every
//! shared store exactly once (registry, bus, oracle, ledger, rating
//! store), wires per-validator state together, and drives the run.
//! Each node gets one driver/inbox task and one timeout sweeper;
//! consensus outcomes flow back over an event channel and are routed
//! into the ledger and rating store here, so no component holds a
//! back-pointer into another.

use {
  super::{CommitCtx, NodeEvent, NodeStats, Role, VirtualNode},
  crate::{
    bus::{BusStats, MessageBus},
    chain::Blockchain,
    config::Config,
    consensus::{
      AttackConsensus,
      PoolStats,
      TransactionPool,
      VerdictOutcome,
      VoteChoice,
    },
    dataset::Dataset,
    detector::Detector,
    knowledge::DedupStats,
    ledger::{LedgerSnapshot, TokenLedger},
    observation::Observation,
    oracle::RpkiOracle,
    primitives::{Asn, KeyRegistry, Keypair},
    rating::{RatingStore, TrustRating},
    storage::BlockStore,
  },
  indexmap::IndexMap,
  serde::Serialize,
  std::{
    path::PathBuf,
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::{Duration, Instant},
  },
  tokio::sync::{
    mpsc::{unbounded_channel, Receiver, UnboundedReceiver},
    watch,
  },
  tracing::{info, warn},
};

/// Maps logical dataset seconds onto wall time. A speed multiplier
/// of zero (or below) disables waiting and replays as fast as the
/// pipeline allows.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
  start: Instant,
  speed: f64,
}

impl SimClock {
  pub fn new(speed: f64) -> Self {
    Self {
      start: Instant::now(),
      speed,
    }
  }

  pub fn instant_of(&self, logical: f64) -> Instant {
    if self.speed <= 0.0 {
      return self.start;
    }
    self.start + Duration::from_secs_f64(logical / self.speed)
  }
}

/// Applies a consensus outcome to the ledger and the rating store.
///
/// This is the single place rewards and penalties are handed out;
/// events are emitted once per outcome by the node that drove it,
/// so replaying the routing is deterministic.
pub fn route_event(
  event: &NodeEvent,
  ledger: &TokenLedger,
  rating: &RatingStore,
) {
  match event {
    NodeEvent::Committed {
      committer,
      tx,
      swept,
    } => {
      if let Err(err) = ledger.reward_commit(*committer, *swept) {
        warn!("commit reward for {committer} failed: {err}");
      }
      for signature in &tx.signatures {
        if signature.choice == VoteChoice::Approve
          && signature.voter != tx.observer
        {
          if let Err(err) = ledger.reward_vote(signature.voter) {
            warn!("vote reward for {} failed: {err}", signature.voter);
          }
        }
      }
      if !tx.kind.is_attack() && tx.status.confirmed() {
        rating.record_benign(tx.origin);
      }
    }
    NodeEvent::Rejected { .. } => {}
    NodeEvent::VerdictReached { resolution } => {
      let verdict = &resolution.verdict;
      match verdict.verdict {
        VerdictOutcome::Confirmed => {
          rating.record_attack(
            verdict.origin,
            verdict.attack_type,
            verdict.timestamp,
          );
          if let Err(err) = ledger.reward_detection(verdict.observer) {
            warn!("detection reward for {} failed: {err}", verdict.observer);
          }
          for (voter, approve) in &verdict.voters {
            if *approve && *voter != verdict.observer {
              if let Err(err) = ledger.reward_verdict_vote(*voter) {
                warn!("verdict vote reward for {voter} failed: {err}");
              }
            }
          }
        }
        VerdictOutcome::Rejected => {
          ledger.penalize_false_accusation(resolution.proposer);
        }
      }
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
  pub role: Role,
  pub stats: NodeStats,
  pub dedup: DedupStats,
  pub knowledge_entries: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pool: Option<PoolStats>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chain_height: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tip_hash: Option<String>,
  pub chain_faults: usize,
}

/// The in-memory counters and snapshots every external result file
/// is derived from.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
  pub bus: BusStats,
  pub nodes: IndexMap<String, NodeReport>,
  pub ledger: LedgerSnapshot,
  pub ratings: IndexMap<String, TrustRating>,
  pub malformed_records: u64,
}

struct ValidatorWiring {
  ctx: Arc<CommitCtx>,
  node: VirtualNode,
  inbox: Receiver<crate::bus::Envelope>,
}

pub struct Orchestrator {
  config: Arc<Config>,
  ledger: Arc<TokenLedger>,
  rating: Arc<RatingStore>,
  bus: Arc<MessageBus>,
  validators: Vec<ValidatorWiring>,
  observed: Vec<VirtualNode>,
  observations: std::collections::HashMap<Asn, Vec<Observation>>,
  events_rx: UnboundedReceiver<NodeEvent>,
  malformed_records: u64,
}

impl Orchestrator {
  /// Builds the whole population from a dataset. Keypairs are
  /// derived here and published to the registry before any node
  /// runs; chains open their stores (and recover) up front so a
  /// broken data directory aborts startup.
  pub fn new(
    dataset: Dataset,
    config: Arc<Config>,
    data_dir: Option<PathBuf>,
  ) -> anyhow::Result<Self> {
    let oracle = Arc::new(RpkiOracle::new(dataset.vrp));
    let registry = Arc::new(KeyRegistry::new());
    let bus = Arc::new(MessageBus::new(config.inbox_capacity));
    let ledger = Arc::new(TokenLedger::new(config.rewards.clone()));
    let rating = Arc::new(RatingStore::new(config.rating.clone()));
    let (events_tx, events_rx) = unbounded_channel();

    let validator_set = dataset.validators();
    info!(
      "population: {} validators, {} observed ASes, {} VRPs",
      validator_set.len(),
      dataset.roster.len() - validator_set.len(),
      oracle.len(),
    );

    let keypairs: IndexMap<Asn, Keypair> = validator_set
      .iter()
      .map(|&asn| (asn, Keypair::derive(config.seed, asn)))
      .collect();
    for (&asn, keypair) in &keypairs {
      registry.register_keypair(asn, keypair);
    }

    let mut validators = vec![];
    for &asn in &validator_set {
      let chain = match &data_dir {
        Some(dir) => Arc::new(Blockchain::with_store(
          config.genesis_time,
          BlockStore::open(dir.join(format!("{asn}")))?,
        )?),
        None => Arc::new(Blockchain::new(config.genesis_time)),
      };
      let pool = Arc::new(TransactionPool::new(
        asn,
        &validator_set,
        Arc::clone(&config),
      ));
      let attack =
        Arc::new(AttackConsensus::new(asn, Arc::clone(&config)));
      let peers: Vec<Asn> = validator_set
        .iter()
        .copied()
        .filter(|&peer| peer != asn)
        .collect();

      let inbox = bus.register(asn);
      let ctx = Arc::new(CommitCtx {
        asn,
        keypair: keypairs[&asn].clone(),
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
        bus: Arc::clone(&bus),
        chain,
        pool,
        attack,
        peers,
        events: events_tx.clone(),
      });
      let node = VirtualNode::validator(
        Arc::clone(&config),
        Detector::new(Arc::clone(&oracle), Arc::clone(&config)),
        Arc::clone(&ctx),
      );
      validators.push(ValidatorWiring { ctx, node, inbox });
    }

    let observed = dataset
      .roster
      .iter()
      .filter(|(_, spec)| spec.role == Role::Observed)
      .map(|(&asn, _)| {
        VirtualNode::observed(
          asn,
          Arc::clone(&config),
          Detector::new(Arc::clone(&oracle), Arc::clone(&config)),
        )
      })
      .collect();

    Ok(Self {
      config,
      ledger,
      rating,
      bus,
      validators,
      observed,
      observations: dataset.observations,
      events_rx,
      malformed_records: dataset.malformed_records,
    })
  }

  /// Drives the run to quiescence: every observation ingested,
  /// every pending transaction and verdict resolved. Returns the
  /// collected statistics.
  pub async fn run(mut self) -> anyhow::Result<RunStats> {
    let clock = SimClock::new(self.config.speed_multiplier);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingesting = Arc::new(AtomicUsize::new(0));

    let mut node_handles = vec![];
    let mut sweeper_handles = vec![];
    let ctxs: Vec<Arc<CommitCtx>> =
      self.validators.iter().map(|v| Arc::clone(&v.ctx)).collect();

    for wiring in self.validators.drain(..) {
      let observations = self
        .observations
        .remove(&wiring.node.asn)
        .unwrap_or_default();
      if !observations.is_empty() {
        ingesting.fetch_add(1, Ordering::SeqCst);
      }
      node_handles.push(spawn_node(
        wiring.node,
        Some(wiring.inbox),
        Some(Arc::clone(&wiring.ctx)),
        observations,
        clock,
        shutdown_rx.clone(),
        Arc::clone(&ingesting),
        self.config.knowledge_cleanup_interval,
      ));
      sweeper_handles.push(spawn_sweeper(
        wiring.ctx,
        shutdown_rx.clone(),
        self.config.sweep_interval(),
      ));
    }

    for node in self.observed.drain(..) {
      let observations =
        self.observations.remove(&node.asn).unwrap_or_default();
      if !observations.is_empty() {
        ingesting.fetch_add(1, Ordering::SeqCst);
      }
      node_handles.push(spawn_node(
        node,
        None,
        None,
        observations,
        clock,
        shutdown_rx.clone(),
        Arc::clone(&ingesting),
        self.config.knowledge_cleanup_interval,
      ));
    }

    // route events until the run goes quiet, then signal shutdown
    let grace = self.config.sweep_interval();
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let mut sweep_epoch = tokio::time::interval(self.config.sweep_interval());
    let mut quiet_since: Option<Instant> = None;
    loop {
      tokio::select! {
        Some(event) = self.events_rx.recv() => {
          route_event(&event, &self.ledger, &self.rating);
          quiet_since = None;
        }
        _ = sweep_epoch.tick() => self.ledger.begin_sweep(),
        _ = poll.tick() => {
          let idle = ingesting.load(Ordering::SeqCst) == 0
            && ctxs.iter().all(|ctx| {
              ctx.pool.pending_len() == 0 && ctx.attack.pending_len() == 0
            });
          if !idle {
            quiet_since = None;
          } else if let Some(since) = quiet_since {
            if since.elapsed() >= grace {
              break;
            }
          } else {
            quiet_since = Some(Instant::now());
          }
        }
      }
    }

    shutdown_tx.send(true).ok();
    let mut nodes = vec![];
    for handle in node_handles {
      nodes.push(handle.await?);
    }
    for handle in sweeper_handles {
      handle.await?;
    }
    // late events from the shutdown drain
    while let Ok(event) = self.events_rx.try_recv() {
      route_event(&event, &self.ledger, &self.rating);
    }

    Ok(self.collect(nodes, ctxs))
  }

  fn collect(
    &self,
    nodes: Vec<VirtualNode>,
    ctxs: Vec<Arc<CommitCtx>>,
  ) -> RunStats {
    let mut reports = IndexMap::new();
    for node in &nodes {
      let ctx = ctxs.iter().find(|ctx| ctx.asn == node.asn);
      reports.insert(node.asn.to_string(), NodeReport {
        role: node.role,
        stats: node.stats(),
        dedup: node.dedup_stats(),
        knowledge_entries: node.knowledge_len(),
        pool: ctx.map(|ctx| ctx.pool.stats()),
        chain_height: ctx.map(|ctx| ctx.chain.height()),
        tip_hash: ctx.map(|ctx| ctx.chain.tip_hash_b58()),
        chain_faults: ctx
          .map(|ctx| ctx.chain.verify_full_chain(None).len())
          .unwrap_or(0),
      });
    }

    RunStats {
      bus: self.bus.stats(),
      nodes: reports,
      ledger: self.ledger.snapshot(),
      ratings: self
        .rating
        .snapshot()
        .into_iter()
        .map(|(asn, rating)| (asn.to_string(), rating))
        .collect(),
      malformed_records: self.malformed_records,
    }
  }
}

#[allow(clippy::too_many_arguments)]
fn spawn_node(
  mut node: VirtualNode,
  mut inbox: Option<Receiver<crate::bus::Envelope>>,
  ctx: Option<Arc<CommitCtx>>,
  observations: Vec<Observation>,
  clock: SimClock,
  mut shutdown: watch::Receiver<bool>,
  ingesting: Arc<AtomicUsize>,
  cleanup_interval: Duration,
) -> tokio::task::JoinHandle<VirtualNode> {
  tokio::spawn(async move {
    let mut observations = observations.into_iter().peekable();
    let mut draining = observations.peek().is_some();
    let mut cleanup = tokio::time::interval(cleanup_interval);

    loop {
      let due = observations.peek().map(|o| clock.instant_of(o.timestamp));
      tokio::select! {
        _ = async {
          match due {
            Some(at) => {
              tokio::time::sleep_until(at.into()).await;
            }
            None => std::future::pending::<()>().await,
          }
        } => {
          if let Some(observation) = observations.next() {
            node.ingest(&observation);
          }
          if draining && observations.peek().is_none() {
            draining = false;
            ingesting.fetch_sub(1, Ordering::SeqCst);
          }
        }
        envelope = async {
          match inbox.as_mut() {
            Some(inbox) => inbox.recv().await,
            None => std::future::pending().await,
          }
        } => {
          if let Some(envelope) = envelope {
            node.handle(envelope);
          }
        }
        _ = cleanup.tick() => node.maintain(),
        _ = shutdown.changed() => break,
      }
    }

    // drain what is already queued, then force-resolve in-flight
    // consensus so nothing waits on an unreachable peer
    if let Some(inbox) = inbox.as_mut() {
      while let Ok(envelope) = inbox.try_recv() {
        node.handle(envelope);
      }
    }
    if let Some(ctx) = &ctx {
      for resolution in ctx.pool.drain() {
        ctx.execute(resolution);
      }
      for resolution in ctx.attack.drain() {
        ctx.execute_verdict(resolution);
      }
    }
    node
  })
}

fn spawn_sweeper(
  ctx: Arc<CommitCtx>,
  mut shutdown: watch::Receiver<bool>,
  interval: Duration,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          for resolution in ctx.pool.sweep(Instant::now()) {
            ctx.execute(resolution);
          }
          for resolution in ctx.attack.sweep(Instant::now()) {
            ctx.execute_verdict(resolution);
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}

//! Fixture builders and a synchronously pumped cluster.
//!
//! The cluster wires validators together exactly the way the
//! orchestrator does, but message delivery and event routing are
//! driven by hand so tests control interleaving deterministically:
//! ingest, pump until quiet, sweep with a fabricated deadline.

use {
  crate::{
    bus::MessageBus,
    chain::Blockchain,
    config::Config,
    consensus::{AttackConsensus, TransactionPool},
    detector::Detector,
    node::{orchestrator::route_event, CommitCtx, NodeEvent, VirtualNode},
    observation::{AnnouncementType, Observation},
    oracle::{RpkiOracle, VrpEntry},
    ledger::TokenLedger,
    primitives::{Asn, KeyRegistry, Keypair},
    rating::RatingStore,
  },
  std::{sync::Arc, time::Instant},
  tokio::sync::mpsc::{
    unbounded_channel,
    Receiver,
    UnboundedReceiver,
  },
};

pub fn obs(
  source: u32,
  prefix: &str,
  origin: u32,
  timestamp: f64,
  announcement: AnnouncementType,
) -> Observation {
  Observation {
    timestamp,
    prefix: prefix.parse().unwrap(),
    origin: Asn(origin),
    as_path: vec![Asn(source), Asn(origin)],
    source: Asn(source),
    announcement,
    scenario_id: None,
  }
}

pub fn announce(source: u32, prefix: &str, origin: u32, t: f64) -> Observation {
  obs(source, prefix, origin, t, AnnouncementType::Announce)
}

pub fn withdraw(source: u32, prefix: &str, origin: u32, t: f64) -> Observation {
  obs(source, prefix, origin, t, AnnouncementType::Withdraw)
}

pub fn roa(prefix: &str, max_length: u8, origin: u32) -> VrpEntry {
  VrpEntry {
    prefix: prefix.parse().unwrap(),
    max_length,
    origin: Asn(origin),
  }
}

pub struct Cluster {
  pub config: Arc<Config>,
  pub ledger: Arc<TokenLedger>,
  pub rating: Arc<RatingStore>,
  pub bus: Arc<MessageBus>,
  pub nodes: Vec<VirtualNode>,
  pub ctxs: Vec<Arc<CommitCtx>>,
  inboxes: Vec<Receiver<crate::bus::Envelope>>,
  events: UnboundedReceiver<NodeEvent>,
}

impl Cluster {
  pub fn new(validators: &[u32], vrp: Vec<VrpEntry>) -> Self {
    let config = Arc::new(Config::default());
    let validator_set: Vec<Asn> =
      validators.iter().map(|&asn| Asn(asn)).collect();
    let oracle = Arc::new(RpkiOracle::new(vrp));
    let registry = Arc::new(KeyRegistry::new());
    let bus = Arc::new(MessageBus::new(config.inbox_capacity));
    let ledger = Arc::new(TokenLedger::new(config.rewards.clone()));
    let rating = Arc::new(RatingStore::new(config.rating.clone()));
    let (events_tx, events) = unbounded_channel();

    let mut nodes = vec![];
    let mut ctxs = vec![];
    let mut inboxes = vec![];
    for &asn in &validator_set {
      let keypair = Keypair::derive(config.seed, asn);
      registry.register_keypair(asn, &keypair);
      inboxes.push(bus.register(asn));

      let ctx = Arc::new(CommitCtx {
        asn,
        keypair,
        config: Arc::clone(&config),
        registry: Arc::clone(&registry),
        bus: Arc::clone(&bus),
        chain: Arc::new(Blockchain::new(config.genesis_time)),
        pool: Arc::new(TransactionPool::new(
          asn,
          &validator_set,
          Arc::clone(&config),
        )),
        attack: Arc::new(AttackConsensus::new(asn, Arc::clone(&config))),
        peers: validator_set
          .iter()
          .copied()
          .filter(|&peer| peer != asn)
          .collect(),
        events: events_tx.clone(),
      });
      nodes.push(VirtualNode::validator(
        Arc::clone(&config),
        Detector::new(Arc::clone(&oracle), Arc::clone(&config)),
        Arc::clone(&ctx),
      ));
      ctxs.push(ctx);
    }

    Self {
      config,
      ledger,
      rating,
      bus,
      nodes,
      ctxs,
      inboxes,
      events,
    }
  }

  /// Ingests an observation at the node with the given index and
  /// delivers everything it causes.
  pub fn ingest(&mut self, node: usize, observation: &Observation) {
    self.nodes[node].ingest(observation);
    self.settle();
  }

  /// Delivers queued messages round-robin until every inbox is
  /// empty, then routes accumulated consensus events.
  pub fn settle(&mut self) {
    loop {
      let mut handled = 0;
      for index in 0..self.nodes.len() {
        while let Ok(envelope) = self.inboxes[index].try_recv() {
          self.nodes[index].handle(envelope);
          handled += 1;
        }
      }
      if handled == 0 {
        break;
      }
    }
    while let Ok(event) = self.events.try_recv() {
      route_event(&event, &self.ledger, &self.rating);
    }
  }

  /// Runs one timeout sweep per validator as if `elapsed` wall time
  /// had passed, settling deliveries after each step so commit
  /// announcements propagate in a deterministic order and verdict
  /// rounds opened by a swept commit resolve through their ballots
  /// before their own deadline is judged.
  pub fn sweep_after(&mut self, elapsed: std::time::Duration) {
    let deadline = Instant::now() + elapsed;
    for index in 0..self.ctxs.len() {
      let ctx = Arc::clone(&self.ctxs[index]);
      for resolution in ctx.pool.sweep(deadline) {
        ctx.execute(resolution);
      }
      self.settle();
      for resolution in ctx.attack.sweep(deadline) {
        ctx.execute_verdict(resolution);
      }
      self.settle();
    }
  }

  pub fn chain(&self, node: usize) -> &Blockchain {
    &self.ctxs[node].chain
  }

  pub fn tips(&self) -> Vec<String> {
    self.ctxs.iter().map(|ctx| ctx.chain.tip_hash_b58()).collect()
  }

  pub fn heights(&self) -> Vec<u64> {
    self.ctxs.iter().map(|ctx| ctx.chain.height()).collect()
  }

  pub fn verify_all_chains(&self) -> usize {
    self
      .ctxs
      .iter()
      .map(|ctx| {
        ctx
          .chain
          .verify_full_chain(Some(&ctx.registry))
          .len()
      })
      .sum()
  }
}

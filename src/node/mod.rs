//! Per-AS virtual nodes.
//!
//! A validator node runs the whole pipeline: dedup, classification,
//! proposal, voting, commits and verdict rounds. An observed node
//! only tracks its own knowledge. Nodes own all of their mutable
//! pipeline state; everything shared (bus, registry, oracle, chain,
//! pool) arrives injected through the commit context, and rewards
//! flow out through an event channel instead of back-pointers into
//! the ledger.

pub mod orchestrator;

use {
  crate::{
    bus::{Envelope, Message, MessageBus},
    chain::{Blockchain, BlockPayload, CommitSeal},
    config::Config,
    consensus::{
      AttackConsensus,
      Recall,
      Resolution,
      Transaction,
      TransactionPool,
      TxKind,
      VerdictOutcome,
      VerdictProposal,
      VerdictResolution,
      VoteChoice,
      VoteSignature,
    },
    detector::{
      is_bogon,
      AttackKind,
      Classification,
      Detector,
      FlapTracker,
    },
    knowledge::{DedupDecision, DedupStats, KnowledgeBase, LastSeenTable},
    observation::Observation,
    oracle::RouteValidity,
    primitives::{Asn, KeyRegistry, Keypair, ToBase58String},
  },
  serde::{Deserialize, Serialize},
  std::{sync::Arc, time::Instant},
  tokio::sync::mpsc::UnboundedSender,
  tracing::{debug, warn},
};

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Validator,
  Observed,
}

/// Consensus outcomes a node reports to the orchestrator, which
/// routes them into the ledger and the rating store.
#[derive(Debug, Clone)]
pub enum NodeEvent {
  Committed {
    committer: Asn,
    tx: Transaction,
    swept: bool,
  },
  Rejected {
    observer: Asn,
    tx: Transaction,
  },
  VerdictReached {
    resolution: VerdictResolution,
  },
}

/// Counters a node accumulates over its lifetime.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct NodeStats {
  pub ingested: u64,
  pub skipped_dedup: u64,
  pub proposed: u64,
  pub attacks_detected: u64,
  pub votes_cast: u64,
  pub invalid_messages: u64,
  pub adopted_blocks: u64,
}

/// Everything a validator needs to finalize consensus decisions
/// outside the pool lock: its chain replica, the bus, the shared
/// registry and the event channel back to the orchestrator. The
/// timeout sweeper holds the same context, so commit execution is
/// identical on both paths.
pub struct CommitCtx {
  pub asn: Asn,
  pub keypair: Keypair,
  pub config: Arc<Config>,
  pub registry: Arc<KeyRegistry>,
  pub bus: Arc<MessageBus>,
  pub chain: Arc<Blockchain>,
  pub pool: Arc<TransactionPool>,
  pub attack: Arc<AttackConsensus>,
  pub peers: Vec<Asn>,
  pub events: UnboundedSender<NodeEvent>,
}

impl CommitCtx {
  /// Executes a finalized transaction: seal, append to the local
  /// replica, announce to every peer, report to the orchestrator,
  /// and open a verdict round when the committed record claims an
  /// attack. Called with no locks held.
  pub fn execute(&self, resolution: Resolution) {
    let Resolution {
      tx,
      evidence,
      swept,
    } = resolution;

    if !tx.status.commits() {
      debug!("{} dropped rejected tx {}", self.asn, tx.short_id());
      let _ = self.events.send(NodeEvent::Rejected {
        observer: self.asn,
        tx,
      });
      return;
    }

    let seal = CommitSeal::new(
      &self.keypair,
      BlockPayload::Transaction(tx.clone()),
      self.asn,
      tx.created_at,
    );
    let block = match self.chain.append(seal.clone()) {
      Ok(block) => block,
      Err(err) => {
        // the block is lost; roll the record back to rejected
        warn!("{} lost block for tx {}: {err}", self.asn, tx.short_id());
        let mut tx = tx;
        tx.status = crate::consensus::TxStatus::Rejected;
        let _ = self.events.send(NodeEvent::Rejected {
          observer: self.asn,
          tx,
        });
        return;
      }
    };
    debug!(
      "{} committed tx {} at height {} [{}]",
      self.asn,
      tx.short_id(),
      block.height,
      block.hash().to_b58(),
    );

    self.bus.broadcast(
      &self.keypair,
      self.asn,
      &self.peers,
      &Message::BlockCommit { seal },
    );
    let _ = self.events.send(NodeEvent::Committed {
      committer: self.asn,
      tx: tx.clone(),
      swept,
    });

    if let TxKind::Attack(kind) = tx.kind {
      self.open_verdict(&tx, kind, evidence);
    }
  }

  /// Drafts and broadcasts the verdict round for a committed attack
  /// transaction, unless this node already adjudicated the event.
  fn open_verdict(&self, tx: &Transaction, kind: AttackKind, evidence: Vec<f64>) {
    let peers: Vec<Asn> = self
      .peers
      .iter()
      .copied()
      .take(self.config.max_broadcast_peers)
      .collect();
    if let Some(proposal) = self.attack.draft(
      &self.keypair,
      tx,
      kind,
      evidence,
      peers.len(),
      Instant::now(),
    ) {
      debug!(
        "{} opened {} verdict round for tx {}",
        self.asn,
        kind.label(),
        tx.short_id()
      );
      self.bus.broadcast(
        &self.keypair,
        self.asn,
        &peers,
        &Message::AttackProposal { proposal },
      );
    }
  }

  /// Executes a resolved verdict round. Confirmed verdicts become
  /// verdict blocks and are announced; rejected ones only cost the
  /// proposer its false-accusation penalty.
  pub fn execute_verdict(&self, resolution: VerdictResolution) {
    if resolution.verdict.verdict == VerdictOutcome::Confirmed {
      let verdict = &resolution.verdict;
      let seal = CommitSeal::new(
        &self.keypair,
        BlockPayload::Verdict(verdict.clone()),
        self.asn,
        self.config.logical_time(verdict.timestamp),
      );
      // remember our own verdict so the broadcast echoing back from
      // peers cannot append it twice
      self.attack.adopt_remote(&verdict.tx_id);
      match self.chain.append(seal.clone()) {
        Ok(block) => {
          debug!(
            "{} confirmed {} verdict against {} at height {}",
            self.asn,
            verdict.attack_type.label(),
            verdict.origin,
            block.height
          );
          self.bus.broadcast(
            &self.keypair,
            self.asn,
            &self.peers,
            &Message::BlockCommit { seal },
          );
        }
        Err(err) => {
          warn!(
            "{} lost verdict block for tx {}: {err}",
            self.asn,
            verdict.tx_id.to_b58()
          );
          return;
        }
      }
    }
    let _ = self
      .events
      .send(NodeEvent::VerdictReached { resolution });
  }
}

/// One AS in the simulated population.
pub struct VirtualNode {
  pub asn: Asn,
  pub role: Role,
  config: Arc<Config>,
  detector: Detector,
  knowledge: KnowledgeBase,
  last_seen: LastSeenTable,
  flap: FlapTracker,
  ctx: Option<Arc<CommitCtx>>,
  stats: NodeStats,
  clock_high_water: f64,
}

impl VirtualNode {
  pub fn validator(
    config: Arc<Config>,
    detector: Detector,
    ctx: Arc<CommitCtx>,
  ) -> Self {
    let asn = ctx.asn;
    Self {
      asn,
      role: Role::Validator,
      knowledge: KnowledgeBase::new(
        config.knowledge_window,
        config.knowledge_max,
      ),
      last_seen: LastSeenTable::new(
        config.rpki_dedup_window,
        config.last_seen_max,
      ),
      flap: FlapTracker::new(config.flap_window, config.flap_dedup),
      detector,
      ctx: Some(ctx),
      stats: NodeStats::default(),
      clock_high_water: 0.0,
      config,
    }
  }

  pub fn observed(asn: Asn, config: Arc<Config>, detector: Detector) -> Self {
    Self {
      asn,
      role: Role::Observed,
      knowledge: KnowledgeBase::new(
        config.knowledge_window,
        config.knowledge_max,
      ),
      last_seen: LastSeenTable::new(
        config.nonrpki_dedup_window,
        config.last_seen_max,
      ),
      flap: FlapTracker::new(config.flap_window, config.flap_dedup),
      detector,
      ctx: None,
      stats: NodeStats::default(),
      clock_high_water: 0.0,
      config,
    }
  }

  /// Drives one observation through the pipeline. Observed nodes
  /// only track knowledge; validators classify, dedup, and propose.
  pub fn ingest(&mut self, observation: &Observation) {
    self.stats.ingested += 1;
    self.clock_high_water = self.clock_high_water.max(observation.timestamp);

    let classification =
      self.detector.classify(observation, &mut self.flap);

    let ctx = match &self.ctx {
      Some(ctx) => Arc::clone(ctx),
      None => {
        // observed role: knowledge tracking only
        self.last_seen.check(
          observation.prefix,
          observation.origin,
          observation.timestamp,
          classification.is_attack(),
        );
        self.knowledge.insert(
          observation.prefix,
          observation.origin,
          observation.timestamp,
        );
        return;
      }
    };

    let decision = self.last_seen.check(
      observation.prefix,
      observation.origin,
      observation.timestamp,
      classification.is_attack(),
    );
    if decision == DedupDecision::Skip {
      self.stats.skipped_dedup += 1;
      return;
    }

    self.knowledge.insert(
      observation.prefix,
      observation.origin,
      observation.timestamp,
    );

    let kind = match classification {
      Classification::Benign => TxKind::Regular,
      Classification::Attack(kind) => {
        self.stats.attacks_detected += 1;
        TxKind::Attack(kind)
      }
    };
    let evidence = if kind == TxKind::Attack(AttackKind::Flapping) {
      self.flap.evidence(&observation.prefix, observation.origin)
    } else {
      vec![]
    };

    let tx = Transaction::build(
      observation,
      kind,
      self.config.logical_time(observation.timestamp),
    );
    let proposal =
      ctx.pool.propose(&ctx.keypair, tx, evidence, Instant::now());
    self.stats.proposed += 1;

    ctx.bus.broadcast(
      &ctx.keypair,
      self.asn,
      &proposal.peers,
      &Message::VoteRequest { tx: proposal.tx },
    );
    if let Some(evicted) = proposal.evicted {
      ctx.execute(evicted);
    }
  }

  /// Dispatches one bus message. Malformed envelopes and signatures
  /// drop silently into a counter, exactly like unroutable noise.
  pub fn handle(&mut self, envelope: Envelope) {
    let ctx = match &self.ctx {
      Some(ctx) => Arc::clone(ctx),
      None => return,
    };
    if !envelope.verify(&ctx.registry) {
      self.stats.invalid_messages += 1;
      debug!("{} dropped unverifiable envelope", self.asn);
      return;
    }

    match envelope.message {
      Message::VoteRequest { tx } => {
        self.on_vote_request(&ctx, envelope.from, tx)
      }
      Message::VoteResponse { tx_id, vote } => {
        if !vote.verify(&ctx.registry, &tx_id) {
          self.stats.invalid_messages += 1;
          return;
        }
        if let Some(resolution) = ctx.pool.record_response(&tx_id, vote) {
          ctx.execute(resolution);
        }
      }
      Message::AttackProposal { proposal } => {
        self.on_attack_proposal(&ctx, proposal)
      }
      Message::AttackVote { tx_id, ballot } => {
        if !ballot.verify(&ctx.registry, &tx_id) {
          self.stats.invalid_messages += 1;
          return;
        }
        if let Some(resolution) = ctx.attack.record_ballot(&tx_id, &ballot)
        {
          ctx.execute_verdict(resolution);
        }
      }
      Message::BlockCommit { seal } => self.on_block_commit(&ctx, seal),
    }
  }

  fn on_vote_request(&mut self, ctx: &CommitCtx, from: Asn, tx: Transaction) {
    // the proposer evidently observes routes overlapping this
    // prefix; remember it for our own broadcasts
    ctx.pool.note_neighbor(tx.prefix, tx.observer);

    match ctx.pool.recall(&tx.id) {
      Recall::Committed => {
        self.reply_vote(ctx, from, &tx, VoteChoice::Approve);
        return;
      }
      Recall::Voted(choice) => {
        self.reply_vote(ctx, from, &tx, choice);
        return;
      }
      Recall::Pending => return, // our own proposal echoed back
      Recall::Unknown => {}
    }

    let well_formed = tx
      .proposer_signature()
      .map(|s| s.verify(&ctx.registry, &tx.id))
      .unwrap_or(false);
    if !well_formed {
      self.stats.invalid_messages += 1;
      return;
    }

    let choice = self.decide_vote(&tx);
    ctx.pool.record_cast(tx.id, choice);
    self.stats.votes_cast += 1;
    self.reply_vote(ctx, from, &tx, choice);
  }

  fn reply_vote(
    &self,
    ctx: &CommitCtx,
    to: Asn,
    tx: &Transaction,
    choice: VoteChoice,
  ) {
    let vote = VoteSignature::sign(&ctx.keypair, self.asn, &tx.id, choice);
    ctx.bus.send(Envelope::sign(
      &ctx.keypair,
      self.asn,
      to,
      Message::VoteResponse {
        tx_id: tx.id,
        vote,
      },
    ));
  }

  /// The three-way vote decision.
  ///
  /// Reject needs contradicting evidence: a proposer recording as
  /// benign what our own detector flags as an attack. An attack
  /// claim we cannot verify is not contradicted, it is simply
  /// unknown; the verdict round adjudicates the claim itself.
  /// Approve covers what we observed ourselves or can validate
  /// against the RPKI table; everything else is no-knowledge.
  fn decide_vote(&self, tx: &Transaction) -> VoteChoice {
    if tx.kind == TxKind::Regular
      && self.detector.reclassify(&tx.prefix, tx.origin).is_attack()
    {
      return VoteChoice::Reject;
    }

    if self.knowledge.knows(&tx.prefix, tx.origin, tx.timestamp) {
      return VoteChoice::Approve;
    }
    if self.detector.oracle().validate(&tx.prefix, tx.origin)
      == RouteValidity::Valid
    {
      return VoteChoice::Approve;
    }
    VoteChoice::NoKnowledge
  }

  fn on_attack_proposal(&mut self, ctx: &CommitCtx, proposal: VerdictProposal) {
    if !proposal.verify(&ctx.registry) {
      self.stats.invalid_messages += 1;
      return;
    }
    let agree = self.adjudicate(&proposal);
    if let Some(ballot) =
      ctx.attack.consider(&ctx.keypair, &proposal, agree)
    {
      self.stats.votes_cast += 1;
      ctx.bus.send(Envelope::sign(
        &ctx.keypair,
        self.asn,
        proposal.proposer,
        Message::AttackVote {
          tx_id: proposal.tx_id,
          ballot,
        },
      ));
    }
  }

  /// Re-runs the detector over the claim with the data this node
  /// has. Hijack claims need both the oracle's agreement and a
  /// matching observation in our own knowledge base; an accusation
  /// nobody else witnessed does not get corroborated. Bogon and
  /// flapping claims carry everything needed to check them.
  fn adjudicate(&self, proposal: &VerdictProposal) -> bool {
    let oracle = self.detector.oracle();
    let witnessed = self.knowledge.knows(
      &proposal.prefix,
      proposal.origin,
      proposal.timestamp,
    );
    match proposal.attack_type {
      AttackKind::PrefixHijack => {
        witnessed
          && oracle.validate(&proposal.prefix, proposal.origin)
            == RouteValidity::Invalid
      }
      AttackKind::SubprefixHijack => {
        witnessed
          && oracle.validate(&proposal.prefix, proposal.origin)
            == RouteValidity::NotFound
          && oracle
            .covering_conflict(&proposal.prefix, proposal.origin)
            .is_some()
      }
      AttackKind::BogonInjection => is_bogon(&proposal.prefix),
      AttackKind::Flapping => FlapTracker::evidence_holds(
        &proposal.evidence,
        self.config.flap_window,
        self.config.flap_dedup,
        self.config.flap_threshold,
      ),
      AttackKind::RouteLeak => false,
    }
  }

  fn on_block_commit(&mut self, ctx: &CommitCtx, seal: CommitSeal) {
    if !seal.verify(&ctx.registry) {
      self.stats.invalid_messages += 1;
      return;
    }
    let adopt = match &seal.payload {
      BlockPayload::Transaction(tx) => ctx.pool.adopt_remote(&tx.id),
      BlockPayload::Verdict(verdict) => {
        ctx.attack.adopt_remote(&verdict.tx_id)
      }
      BlockPayload::Genesis => false,
    };
    if !adopt {
      return; // re-delivery or our own echo
    }
    match ctx.chain.append(seal) {
      Ok(block) => {
        self.stats.adopted_blocks += 1;
        debug!(
          "{} adopted remote block at height {}",
          self.asn, block.height
        );
      }
      Err(err) => {
        warn!("{} failed to adopt remote block: {err}", self.asn);
      }
    }
  }

  /// Low-frequency upkeep: expire knowledge older than the window.
  pub fn maintain(&mut self) {
    self.knowledge.expire(self.clock_high_water);
  }

  pub fn stats(&self) -> NodeStats {
    self.stats
  }

  pub fn dedup_stats(&self) -> DedupStats {
    self.last_seen.stats()
  }

  pub fn knowledge_len(&self) -> usize {
    self.knowledge.len()
  }
}

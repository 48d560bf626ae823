//! P2P transaction pool.
//!
//! Per-validator pending/committed bookkeeping for the three-way
//! vote. The whole pool hangs off one mutex and every operation
//! follows the same discipline: decide inside the lock, hand the
//! resulting sends and chain appends back to the caller to execute
//! outside it. That rule is what keeps the commit path deadlock
//! free, since chain appends are the only blocking I/O around.

use {
  super::{
    transaction::{Transaction, TxStatus},
    vote::{VoteChoice, VoteSignature},
  },
  crate::{
    config::Config,
    primitives::{Asn, Keypair, Multihash},
  },
  ipnet::IpNet,
  rand::{seq::SliceRandom, SeedableRng},
  rand_chacha::ChaCha20Rng,
  serde::Serialize,
  std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
      Mutex,
    },
    time::Instant,
  },
};

// caps on the relevant-neighbor cache
const RELEVANT_PREFIXES_MAX: usize = 1_024;
const RELEVANT_PEERS_PER_PREFIX: usize = 8;

/// A finalized transaction ready to execute outside the lock.
/// `tx.status` tells the caller whether it commits or is dropped.
#[derive(Debug, Clone)]
pub struct Resolution {
  pub tx: Transaction,
  pub evidence: Vec<f64>,
  pub swept: bool,
}

/// Outcome of proposing a transaction: the peers to ask, plus any
/// pending transaction that had to be force-timed-out to make room.
#[derive(Debug)]
pub struct Proposal {
  pub tx: Transaction,
  pub peers: Vec<Asn>,
  pub evicted: Option<Resolution>,
}

/// What the pool already knows about a transaction id when a vote
/// request for it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recall {
  /// Already committed; the cached approve is re-sent.
  Committed,
  /// We voted on it before; the same ballot is re-sent.
  Voted(VoteChoice),
  /// It sits in our own pending set; duplicates are ignored.
  Pending,
  Unknown,
}

#[derive(Debug)]
struct PendingTx {
  tx: Transaction,
  deadline: Instant,
  voters: HashSet<Asn>,
  approves: usize,
  rejects: usize,
  no_knowledge: usize,
  evidence: Vec<f64>,
}

#[derive(Debug, Default)]
struct PoolState {
  pending: HashMap<Multihash, PendingTx>,
  order: VecDeque<Multihash>,
  committed: HashSet<Multihash>,
  committed_order: VecDeque<Multihash>,
  voted: HashMap<Multihash, VoteChoice>,
  voted_order: VecDeque<Multihash>,
  relevant: HashMap<IpNet, Vec<Asn>>,
  relevant_order: VecDeque<IpNet>,
}

/// Counters the consensus log outputs are derived from.
#[derive(Debug, Default)]
pub struct PoolCounters {
  pub proposed: AtomicU64,
  pub committed: AtomicU64,
  pub rejected: AtomicU64,
  pub timed_out_confirmed: AtomicU64,
  pub timed_out_insufficient: AtomicU64,
  pub timed_out_single_witness: AtomicU64,
  pub forced_timeouts: AtomicU64,
  pub duplicate_votes: AtomicU64,
  pub unknown_responses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
  pub proposed: u64,
  pub committed: u64,
  pub rejected: u64,
  pub timed_out_confirmed: u64,
  pub timed_out_insufficient: u64,
  pub timed_out_single_witness: u64,
  pub forced_timeouts: u64,
  pub duplicate_votes: u64,
  pub unknown_responses: u64,
}

pub struct TransactionPool {
  asn: Asn,
  config: Arc<Config>,
  validator_count: usize,
  fallback_peers: Vec<Asn>,
  state: Mutex<PoolState>,
  counters: PoolCounters,
}

impl TransactionPool {
  pub fn new(asn: Asn, validators: &[Asn], config: Arc<Config>) -> Self {
    // a stable, seeded shuffle of the peer set; used whenever the
    // relevant-neighbor cache has nothing better to offer
    let mut fallback_peers: Vec<Asn> =
      validators.iter().copied().filter(|&v| v != asn).collect();
    let mut rng =
      ChaCha20Rng::seed_from_u64(config.seed ^ u64::from(asn.0));
    fallback_peers.shuffle(&mut rng);

    Self {
      asn,
      validator_count: validators.len(),
      fallback_peers,
      config,
      state: Mutex::new(PoolState::default()),
      counters: PoolCounters::default(),
    }
  }

  /// The Proof-of-Population commit threshold:
  /// `max(ConsensusMin, min(N/3 + 1, ConsensusCap))`.
  pub fn threshold(&self) -> usize {
    let population = self.validator_count / 3 + 1;
    self
      .config
      .consensus_min
      .max(population.min(self.config.consensus_cap))
  }

  /// Stores a freshly built transaction with the proposer's own
  /// approve ballot and picks the peers to ask. When the pool is at
  /// capacity the oldest pending transaction is force-timed-out
  /// first and returned for execution.
  pub fn propose(
    &self,
    keypair: &Keypair,
    mut tx: Transaction,
    evidence: Vec<f64>,
    now: Instant,
  ) -> Proposal {
    let own_vote =
      VoteSignature::sign(keypair, self.asn, &tx.id, VoteChoice::Approve);
    tx.signatures.push(own_vote);

    let timeout = if tx.kind.is_attack() {
      self.config.attack_timeout
    } else {
      self.config.regular_timeout
    };

    let mut state = self.state.lock().unwrap();

    let evicted = if state.pending.len() >= self.config.pending_max {
      self.force_oldest(&mut state)
    } else {
      None
    };

    let peers = self.peers_for(&state, &tx.prefix);

    let mut voters = HashSet::new();
    voters.insert(self.asn);
    state.order.push_back(tx.id);
    state.pending.insert(tx.id, PendingTx {
      tx: tx.clone(),
      deadline: now + timeout,
      voters,
      approves: 1,
      rejects: 0,
      no_knowledge: 0,
      evidence,
    });
    drop(state);

    self.counters.proposed.fetch_add(1, Ordering::Relaxed);
    Proposal {
      tx,
      peers,
      evicted,
    }
  }

  /// What this pool remembers about a tx id, for answering
  /// re-delivered vote requests.
  pub fn recall(&self, tx_id: &Multihash) -> Recall {
    let state = self.state.lock().unwrap();
    if state.committed.contains(tx_id) {
      Recall::Committed
    } else if let Some(choice) = state.voted.get(tx_id) {
      Recall::Voted(*choice)
    } else if state.pending.contains_key(tx_id) {
      Recall::Pending
    } else {
      Recall::Unknown
    }
  }

  /// Remembers the ballot this node cast for a foreign transaction.
  pub fn record_cast(&self, tx_id: Multihash, choice: VoteChoice) {
    let mut state = self.state.lock().unwrap();
    if state.voted.insert(tx_id, choice).is_none() {
      state.voted_order.push_back(tx_id);
      while state.voted_order.len() > self.config.committed_max {
        if let Some(old) = state.voted_order.pop_front() {
          state.voted.remove(&old);
        }
      }
    }
  }

  /// Learns that a neighbor observes routes overlapping `prefix`,
  /// feeding the relevant-neighbor cache used by `propose`.
  pub fn note_neighbor(&self, prefix: IpNet, neighbor: Asn) {
    if neighbor == self.asn {
      return;
    }
    let mut state = self.state.lock().unwrap();
    if !state.relevant.contains_key(&prefix) {
      state.relevant_order.push_back(prefix);
      while state.relevant_order.len() > RELEVANT_PREFIXES_MAX {
        if let Some(old) = state.relevant_order.pop_front() {
          state.relevant.remove(&old);
        }
      }
    }
    let peers = state.relevant.entry(prefix).or_default();
    if !peers.contains(&neighbor) {
      peers.push(neighbor);
      if peers.len() > RELEVANT_PEERS_PER_PREFIX {
        peers.remove(0);
      }
    }
  }

  /// Records a verified vote response. Unknown tx ids and repeat
  /// voters are dropped; duplicates are how replays and vote
  /// stuffing die. Returns the resolution once the commit or
  /// reject predicate fires.
  pub fn record_response(
    &self,
    tx_id: &Multihash,
    vote: VoteSignature,
  ) -> Option<Resolution> {
    let threshold = self.threshold();
    let mut state = self.state.lock().unwrap();

    let pending = match state.pending.get_mut(tx_id) {
      Some(p) => p,
      None => {
        self.counters.unknown_responses.fetch_add(1, Ordering::Relaxed);
        return None;
      }
    };
    if !pending.voters.insert(vote.voter) {
      self.counters.duplicate_votes.fetch_add(1, Ordering::Relaxed);
      return None;
    }

    match vote.choice {
      VoteChoice::Approve => pending.approves += 1,
      VoteChoice::NoKnowledge => pending.no_knowledge += 1,
      VoteChoice::Reject => pending.rejects += 1,
    }
    pending.tx.signatures.push(vote);

    let status = if pending.approves >= threshold {
      TxStatus::Committed
    } else if pending.rejects >= threshold {
      TxStatus::Rejected
    } else {
      return None;
    };

    let mut pending = state.pending.remove(tx_id).unwrap();
    pending.tx.status = status;
    if status.commits() {
      Self::remember_committed(&mut state, *tx_id, self.config.committed_max);
      self.counters.committed.fetch_add(1, Ordering::Relaxed);
    } else {
      self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    Some(Resolution {
      tx: pending.tx,
      evidence: pending.evidence,
      swept: false,
    })
  }

  /// Resolves every pending transaction past its deadline, oldest
  /// proposal first so replays resolve in a reproducible order. All
  /// three timeout statuses commit; they differ only in how much
  /// of a quorum backs the record.
  pub fn sweep(&self, now: Instant) -> Vec<Resolution> {
    let threshold = self.threshold();
    let mut state = self.state.lock().unwrap();
    let expired: Vec<Multihash> = state
      .order
      .iter()
      .filter(|id| {
        state
          .pending
          .get(id)
          .map(|p| now >= p.deadline)
          .unwrap_or(false)
      })
      .copied()
      .collect();

    let mut resolved = vec![];
    for id in expired {
      if let Some(pending) = state.pending.remove(&id) {
        resolved.push(self.resolve_timeout(&mut state, pending, threshold));
      }
    }
    resolved
  }

  /// Force-resolves everything in flight, used at shutdown.
  pub fn drain(&self) -> Vec<Resolution> {
    let threshold = self.threshold();
    let mut state = self.state.lock().unwrap();
    let ids: Vec<Multihash> = state
      .order
      .iter()
      .filter(|id| state.pending.contains_key(id))
      .copied()
      .collect();
    let mut resolved = vec![];
    for id in ids {
      if let Some(pending) = state.pending.remove(&id) {
        resolved.push(self.resolve_timeout(&mut state, pending, threshold));
      }
    }
    resolved
  }

  /// Adopts a commit another validator announced. Returns true when
  /// it is new to this replica; re-delivery and replays return
  /// false and change nothing.
  pub fn adopt_remote(&self, tx_id: &Multihash) -> bool {
    let mut state = self.state.lock().unwrap();
    if state.committed.contains(tx_id) {
      return false;
    }
    state.pending.remove(tx_id);
    Self::remember_committed(&mut state, *tx_id, self.config.committed_max);
    true
  }

  pub fn pending_len(&self) -> usize {
    self.state.lock().unwrap().pending.len()
  }

  pub fn stats(&self) -> PoolStats {
    let c = &self.counters;
    PoolStats {
      proposed: c.proposed.load(Ordering::Relaxed),
      committed: c.committed.load(Ordering::Relaxed),
      rejected: c.rejected.load(Ordering::Relaxed),
      timed_out_confirmed: c.timed_out_confirmed.load(Ordering::Relaxed),
      timed_out_insufficient: c
        .timed_out_insufficient
        .load(Ordering::Relaxed),
      timed_out_single_witness: c
        .timed_out_single_witness
        .load(Ordering::Relaxed),
      forced_timeouts: c.forced_timeouts.load(Ordering::Relaxed),
      duplicate_votes: c.duplicate_votes.load(Ordering::Relaxed),
      unknown_responses: c.unknown_responses.load(Ordering::Relaxed),
    }
  }

  fn resolve_timeout(
    &self,
    state: &mut PoolState,
    mut pending: PendingTx,
    threshold: usize,
  ) -> Resolution {
    // the proposer's own approve does not count as a witness
    pending.tx.status = if pending.approves >= threshold {
      self
        .counters
        .timed_out_confirmed
        .fetch_add(1, Ordering::Relaxed);
      TxStatus::TimedOutConfirmed
    } else if pending.approves >= 2 {
      self
        .counters
        .timed_out_insufficient
        .fetch_add(1, Ordering::Relaxed);
      TxStatus::TimedOutInsufficient
    } else {
      self
        .counters
        .timed_out_single_witness
        .fetch_add(1, Ordering::Relaxed);
      TxStatus::TimedOutSingleWitness
    };
    Self::remember_committed(
      state,
      pending.tx.id,
      self.config.committed_max,
    );

    Resolution {
      tx: pending.tx,
      evidence: pending.evidence,
      swept: true,
    }
  }

  fn force_oldest(&self, state: &mut PoolState) -> Option<Resolution> {
    let threshold = self.threshold();
    while let Some(id) = state.order.pop_front() {
      if let Some(pending) = state.pending.remove(&id) {
        self.counters.forced_timeouts.fetch_add(1, Ordering::Relaxed);
        return Some(self.resolve_timeout(state, pending, threshold));
      }
    }
    None
  }

  fn remember_committed(state: &mut PoolState, tx_id: Multihash, max: usize) {
    if state.committed.insert(tx_id) {
      state.committed_order.push_back(tx_id);
      while state.committed_order.len() > max {
        if let Some(old) = state.committed_order.pop_front() {
          state.committed.remove(&old);
        }
      }
    }
  }

  fn peers_for(&self, state: &PoolState, prefix: &IpNet) -> Vec<Asn> {
    let mut peers: Vec<Asn> = vec![];
    for (cached, neighbors) in &state.relevant {
      if cached.contains(prefix) || prefix.contains(cached) {
        for &n in neighbors {
          if !peers.contains(&n) {
            peers.push(n);
          }
        }
      }
    }
    for &fallback in &self.fallback_peers {
      if peers.len() >= self.config.max_broadcast_peers {
        break;
      }
      if !peers.contains(&fallback) {
        peers.push(fallback);
      }
    }
    peers.truncate(self.config.max_broadcast_peers);
    peers
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Recall, TransactionPool},
    crate::{
      config::Config,
      consensus::{
        Transaction,
        TxKind,
        TxStatus,
        VoteChoice,
        VoteSignature,
      },
      observation::{AnnouncementType, Observation},
      primitives::{Asn, Keypair},
    },
    chrono::{TimeZone, Utc},
    std::{sync::Arc, time::Instant},
  };

  fn validators(n: u32) -> Vec<Asn> {
    (1..=n).map(Asn).collect()
  }

  fn tx(observer: u32, at: f64) -> Transaction {
    let obs = Observation {
      timestamp: at,
      prefix: "10.0.0.0/24".parse().unwrap(),
      origin: Asn(100),
      as_path: vec![Asn(observer), Asn(100)],
      source: Asn(observer),
      announcement: AnnouncementType::Announce,
      scenario_id: None,
    };
    Transaction::build(
      &obs,
      TxKind::Regular,
      Utc.timestamp_opt(0, 0).unwrap(),
    )
  }

  fn pool_of(n: u32, config: Config) -> (TransactionPool, Keypair) {
    let config = Arc::new(config);
    (
      TransactionPool::new(Asn(1), &validators(n), config),
      Keypair::derive(0, Asn(1)),
    )
  }

  fn approve(voter: u32, tx_id: &Multihash) -> VoteSignature {
    VoteSignature::sign(
      &Keypair::derive(0, Asn(voter)),
      Asn(voter),
      tx_id,
      VoteChoice::Approve,
    )
  }

  fn reject(voter: u32, tx_id: &Multihash) -> VoteSignature {
    VoteSignature::sign(
      &Keypair::derive(0, Asn(voter)),
      Asn(voter),
      tx_id,
      VoteChoice::Reject,
    )
  }

  #[test]
  fn threshold_tracks_population() {
    // small population: floor is the minimum
    let (pool, _) = pool_of(3, Config::default());
    assert_eq!(pool.threshold(), 3);

    // N/3+1 between floor and cap
    let (pool, _) = pool_of(11, Config::default());
    assert_eq!(pool.threshold(), 4);

    // large population: capped
    let (pool, _) = pool_of(60, Config::default());
    assert_eq!(pool.threshold(), 5);
  }

  #[test]
  fn commits_at_exactly_t_approves() {
    let (pool, kp) = pool_of(9, Config::default());
    let proposal = pool.propose(&kp, tx(1, 0.0), vec![], Instant::now());
    let id = proposal.tx.id;
    assert_eq!(pool.threshold(), 4);

    // own approve + 2 peers: one short of T
    assert!(pool.record_response(&id, approve(2, &id)).is_none());
    assert!(pool.record_response(&id, approve(3, &id)).is_none());

    let resolution = pool.record_response(&id, approve(4, &id)).unwrap();
    assert_eq!(resolution.tx.status, TxStatus::Committed);
    assert_eq!(resolution.tx.signatures.len(), 4);
    assert!(!resolution.swept);

    // idempotence: late votes for a committed tx drop silently
    assert!(pool.record_response(&id, approve(5, &id)).is_none());
    assert_eq!(pool.recall(&id), Recall::Committed);
  }

  #[test]
  fn duplicate_voters_are_dropped() {
    let (pool, kp) = pool_of(9, Config::default());
    let proposal = pool.propose(&kp, tx(1, 0.0), vec![], Instant::now());
    let id = proposal.tx.id;

    assert!(pool.record_response(&id, approve(2, &id)).is_none());
    assert!(pool.record_response(&id, approve(2, &id)).is_none());
    assert!(pool.record_response(&id, approve(2, &id)).is_none());
    assert_eq!(pool.stats().duplicate_votes, 2);

    // the replayed voter still only counts once toward T
    assert!(pool.record_response(&id, approve(3, &id)).is_none());
    assert!(pool.record_response(&id, approve(4, &id)).is_some());
  }

  #[test]
  fn reject_quorum_drops_without_commit() {
    let (pool, kp) = pool_of(9, Config::default());
    let proposal = pool.propose(&kp, tx(1, 0.0), vec![], Instant::now());
    let id = proposal.tx.id;

    for voter in 2..=4 {
      pool.record_response(&id, reject(voter, &id));
    }
    let resolution = pool.record_response(&id, reject(5, &id)).unwrap();
    assert_eq!(resolution.tx.status, TxStatus::Rejected);
    assert_eq!(pool.stats().rejected, 1);
    // rejected ids are not remembered as committed
    assert_eq!(pool.recall(&id), Recall::Unknown);
  }

  #[test]
  fn timeout_statuses_grade_by_witness_count() {
    let (pool, kp) = pool_of(9, Config::default());
    let now = Instant::now();
    let deadline = now + Config::default().regular_timeout * 2;

    // quorum reached but commit predicate never fired? resolve as
    // confirmed (approves from 3 peers + self = T)
    let a = pool.propose(&kp, tx(1, 0.0), vec![], now);
    for voter in 2..=4 {
      pool.record_response(&a.tx.id, approve(voter, &a.tx.id));
    }
    // partial evidence: one peer approve
    let b = pool.propose(&kp, tx(1, 10.0), vec![], now);
    pool.record_response(&b.tx.id, approve(2, &b.tx.id));
    // nobody but the observer
    let c = pool.propose(&kp, tx(1, 20.0), vec![], now);

    let mut resolved = pool.sweep(deadline);
    resolved.sort_by_key(|r| (r.tx.timestamp * 100.0) as u64);
    // `a` commits through the predicate before the sweep
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].tx.status, TxStatus::TimedOutInsufficient);
    assert_eq!(resolved[1].tx.status, TxStatus::TimedOutSingleWitness);
    assert!(resolved.iter().all(|r| r.swept));
  }

  #[test]
  fn pending_cap_force_times_out_the_oldest() {
    let mut config = Config::default();
    config.pending_max = 2;
    let (pool, kp) = pool_of(3, config);
    let now = Instant::now();

    let first = pool.propose(&kp, tx(1, 0.0), vec![], now);
    assert!(first.evicted.is_none());
    let second = pool.propose(&kp, tx(1, 10.0), vec![], now);
    assert!(second.evicted.is_none());

    let third = pool.propose(&kp, tx(1, 20.0), vec![], now);
    let evicted = third.evicted.unwrap();
    assert_eq!(evicted.tx.id, first.tx.id);
    assert_eq!(evicted.tx.status, TxStatus::TimedOutSingleWitness);
    assert_eq!(pool.pending_len(), 2);
    assert_eq!(pool.stats().forced_timeouts, 1);
  }

  #[test]
  fn remote_commits_adopt_once() {
    let (pool, _) = pool_of(3, Config::default());
    let id = tx(2, 0.0).id;
    assert!(pool.adopt_remote(&id));
    assert!(!pool.adopt_remote(&id));
    assert_eq!(pool.recall(&id), Recall::Committed);
  }

  #[test]
  fn broadcast_peers_are_capped_and_stable() {
    let (pool, kp) = pool_of(20, Config::default());
    let a = pool.propose(&kp, tx(1, 0.0), vec![], Instant::now());
    assert_eq!(a.peers.len(), 5);
    assert!(!a.peers.contains(&Asn(1)));

    // same seed, same node: same fallback subset
    let (other, kp2) =
      pool_of(20, Config::default());
    let b = other.propose(&kp2, tx(1, 50.0), vec![], Instant::now());
    assert_eq!(a.peers, b.peers);
  }

  #[test]
  fn relevant_neighbors_are_preferred() {
    let (pool, kp) = pool_of(20, Config::default());
    pool.note_neighbor("10.0.0.0/16".parse().unwrap(), Asn(17));
    let proposal = pool.propose(&kp, tx(1, 0.0), vec![], Instant::now());
    assert_eq!(proposal.peers[0], Asn(17));
  }
}

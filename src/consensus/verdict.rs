//! Attack consensus.
//!
//! A committed attack transaction opens a second, narrower vote:
//! the committer drafts a verdict proposal with whatever evidence
//! backs the claim, peers adjudicate it against their own detector
//! and knowledge, and a simple majority with a floor decides. Only
//! confirmed verdicts reach the chain and the rating system.

use {
  super::transaction::Transaction,
  crate::{
    config::Config,
    detector::AttackKind,
    observation::AnnouncementType,
    primitives::{Asn, KeyRegistry, Keypair},
  },
  ed25519_dalek::{Signature, Signer},
  ipnet::IpNet,
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Instant,
  },
};

// bound on the remembered (prefix, origin, kind) triples that keep
// one attack event from spawning a verdict round per witness
const ADJUDICATED_MAX: usize = 4_096;

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
pub enum VerdictOutcome {
  Confirmed,
  Rejected,
}

/// The adjudicated outcome of one attack claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackVerdict {
  pub tx_id: Multihash,
  pub attack_type: AttackKind,
  pub observer: Asn,
  pub origin: Asn,
  pub prefix: IpNet,
  pub approves: usize,
  pub rejects: usize,
  pub voters: Vec<(Asn, bool)>,
  pub verdict: VerdictOutcome,
  pub confidence: f64,
  pub timestamp: f64,
}

/// A draft verdict broadcast by the committer of an attack
/// transaction. Carries the observation fields peers re-classify
/// plus self-contained evidence where the claim needs it (flap
/// transition timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictProposal {
  pub tx_id: Multihash,
  pub attack_type: AttackKind,
  pub proposer: Asn,
  pub prefix: IpNet,
  pub origin: Asn,
  pub announcement: AnnouncementType,
  pub timestamp: f64,
  pub evidence: Vec<f64>,
  pub signature: Signature,
}

impl VerdictProposal {
  fn signing_bytes(
    tx_id: &Multihash,
    attack_type: AttackKind,
    proposer: Asn,
  ) -> Vec<u8> {
    let mut msg = tx_id.to_bytes();
    msg.push(attack_type.label().len() as u8);
    msg.extend_from_slice(attack_type.label().as_bytes());
    msg.extend_from_slice(&proposer.to_le_bytes());
    msg
  }

  pub fn verify(&self, registry: &KeyRegistry) -> bool {
    registry.verify(
      self.proposer,
      &Self::signing_bytes(&self.tx_id, self.attack_type, self.proposer),
      &self.signature,
    )
  }
}

/// A peer's signed agree/disagree ballot over a verdict proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictBallot {
  pub voter: Asn,
  pub approve: bool,
  pub signature: Signature,
}

impl VerdictBallot {
  fn signing_bytes(tx_id: &Multihash, approve: bool) -> Vec<u8> {
    let mut msg = tx_id.to_bytes();
    msg.extend_from_slice(b"verdict");
    msg.push(approve as u8);
    msg
  }

  pub fn sign(
    keypair: &Keypair,
    voter: Asn,
    tx_id: &Multihash,
    approve: bool,
  ) -> Self {
    let signature = keypair.sign(&Self::signing_bytes(tx_id, approve));
    Self {
      voter,
      approve,
      signature,
    }
  }

  pub fn verify(&self, registry: &KeyRegistry, tx_id: &Multihash) -> bool {
    registry.verify(
      self.voter,
      &Self::signing_bytes(tx_id, self.approve),
      &self.signature,
    )
  }
}

/// A resolved verdict round ready to execute outside the lock.
#[derive(Debug, Clone)]
pub struct VerdictResolution {
  pub verdict: AttackVerdict,
  pub proposer: Asn,
}

#[derive(Debug)]
struct PendingVerdict {
  proposal: VerdictProposal,
  deadline: Instant,
  asked: usize,
  voters: HashSet<Asn>,
  ballots: Vec<(Asn, bool)>,
  approves: usize,
  rejects: usize,
}

impl PendingVerdict {
  fn peer_votes(&self) -> usize {
    // the proposer's own approval is not an asked peer
    self.ballots.len() - 1
  }

  fn remaining(&self) -> usize {
    self.asked.saturating_sub(self.peer_votes())
  }

  fn decided(&self, min: usize) -> Option<VerdictOutcome> {
    let remaining = self.remaining();
    if self.approves >= min && self.approves > self.rejects + remaining {
      return Some(VerdictOutcome::Confirmed);
    }
    if self.approves + remaining < min
      || self.rejects >= self.approves + remaining
    {
      return Some(VerdictOutcome::Rejected);
    }
    if remaining == 0 {
      return Some(self.final_outcome(min));
    }
    None
  }

  // majority with a floor; a tie rejects
  fn final_outcome(&self, min: usize) -> VerdictOutcome {
    if self.approves >= min && self.approves > self.rejects {
      VerdictOutcome::Confirmed
    } else {
      VerdictOutcome::Rejected
    }
  }

  fn into_verdict(self, outcome: VerdictOutcome) -> AttackVerdict {
    let total = self.approves + self.rejects;
    AttackVerdict {
      tx_id: self.proposal.tx_id,
      attack_type: self.proposal.attack_type,
      observer: self.proposal.proposer,
      origin: self.proposal.origin,
      prefix: self.proposal.prefix,
      approves: self.approves,
      rejects: self.rejects,
      voters: self.ballots,
      verdict: outcome,
      confidence: if total > 0 {
        self.approves as f64 / total as f64
      } else {
        0.0
      },
      timestamp: self.proposal.timestamp,
    }
  }
}

#[derive(Debug, Default)]
struct VerdictState {
  pending: HashMap<Multihash, PendingVerdict>,
  adjudicated: HashSet<(IpNet, Asn, AttackKind)>,
  adjudicated_order: VecDeque<(IpNet, Asn, AttackKind)>,
  answered: HashSet<Multihash>,
  adopted_blocks: HashSet<Multihash>,
}

impl VerdictState {
  fn mark_adjudicated(&mut self, key: (IpNet, Asn, AttackKind)) -> bool {
    if !self.adjudicated.insert(key) {
      return false;
    }
    self.adjudicated_order.push_back(key);
    while self.adjudicated_order.len() > ADJUDICATED_MAX {
      if let Some(old) = self.adjudicated_order.pop_front() {
        self.adjudicated.remove(&old);
      }
    }
    true
  }
}

/// Per-validator attack consensus state. One mutex, short critical
/// sections, chain appends and bus sends happen outside.
pub struct AttackConsensus {
  asn: Asn,
  config: std::sync::Arc<Config>,
  state: Mutex<VerdictState>,
}

impl AttackConsensus {
  pub fn new(asn: Asn, config: std::sync::Arc<Config>) -> Self {
    Self {
      asn,
      config,
      state: Mutex::new(VerdictState::default()),
    }
  }

  /// Drafts a verdict proposal for a committed attack transaction.
  ///
  /// Returns `None` when this node already took part in a verdict
  /// round for the same (prefix, origin, kind) — one attack event
  /// is adjudicated once no matter how many witnesses commit it.
  pub fn draft(
    &self,
    keypair: &Keypair,
    tx: &Transaction,
    kind: AttackKind,
    evidence: Vec<f64>,
    asked: usize,
    now: Instant,
  ) -> Option<VerdictProposal> {
    let mut state = self.state.lock().unwrap();
    if !state.mark_adjudicated((tx.prefix, tx.origin, kind)) {
      return None;
    }

    let signature = keypair.sign(&VerdictProposal::signing_bytes(
      &tx.id, kind, self.asn,
    ));
    let proposal = VerdictProposal {
      tx_id: tx.id,
      attack_type: kind,
      proposer: self.asn,
      prefix: tx.prefix,
      origin: tx.origin,
      announcement: tx.announcement,
      timestamp: tx.timestamp,
      evidence,
      signature,
    };

    let mut voters = HashSet::new();
    voters.insert(self.asn);
    state.pending.insert(tx.id, PendingVerdict {
      proposal: proposal.clone(),
      deadline: now + self.config.attack_timeout,
      asked,
      voters,
      ballots: vec![(self.asn, true)],
      approves: 1,
      rejects: 0,
    });

    Some(proposal)
  }

  /// Registers an incoming proposal and casts this node's ballot.
  /// Re-delivered proposals and further rounds for an event this
  /// node already adjudicated are no-ops.
  pub fn consider(
    &self,
    keypair: &Keypair,
    proposal: &VerdictProposal,
    agree: bool,
  ) -> Option<VerdictBallot> {
    let mut state = self.state.lock().unwrap();
    if proposal.proposer == self.asn
      || !state.answered.insert(proposal.tx_id)
    {
      return None;
    }
    if !state.mark_adjudicated((
      proposal.prefix,
      proposal.origin,
      proposal.attack_type,
    )) {
      return None;
    }
    drop(state);

    Some(VerdictBallot::sign(
      keypair,
      self.asn,
      &proposal.tx_id,
      agree,
    ))
  }

  /// Records a peer ballot. The signature must already be verified.
  /// Returns the resolution once the round's outcome is decided.
  pub fn record_ballot(
    &self,
    tx_id: &Multihash,
    ballot: &VerdictBallot,
  ) -> Option<VerdictResolution> {
    let mut state = self.state.lock().unwrap();
    let pending = state.pending.get_mut(tx_id)?;
    if !pending.voters.insert(ballot.voter) {
      return None;
    }
    pending.ballots.push((ballot.voter, ballot.approve));
    if ballot.approve {
      pending.approves += 1;
    } else {
      pending.rejects += 1;
    }

    let outcome = pending.decided(self.config.attack_consensus_min)?;
    let pending = state.pending.remove(tx_id).unwrap();
    Some(VerdictResolution {
      proposer: pending.proposal.proposer,
      verdict: pending.into_verdict(outcome),
    })
  }

  /// Resolves every round past its deadline with the final rule, in
  /// a stable order so replays reproduce the same chain.
  pub fn sweep(&self, now: Instant) -> Vec<VerdictResolution> {
    let mut state = self.state.lock().unwrap();
    let mut expired: Vec<Multihash> = state
      .pending
      .iter()
      .filter(|(_, p)| now >= p.deadline)
      .map(|(id, _)| *id)
      .collect();
    expired.sort_by_key(|id| id.to_bytes());

    expired
      .into_iter()
      .filter_map(|id| state.pending.remove(&id))
      .map(|p| {
        let outcome = p.final_outcome(self.config.attack_consensus_min);
        VerdictResolution {
          proposer: p.proposal.proposer,
          verdict: p.into_verdict(outcome),
        }
      })
      .collect()
  }

  /// Force-resolves everything in flight, used at shutdown.
  pub fn drain(&self) -> Vec<VerdictResolution> {
    let mut state = self.state.lock().unwrap();
    let mut ids: Vec<Multihash> = state.pending.keys().copied().collect();
    ids.sort_by_key(|id| id.to_bytes());
    ids
      .into_iter()
      .filter_map(|id| state.pending.remove(&id))
      .map(|p| {
        let outcome = p.final_outcome(self.config.attack_consensus_min);
        VerdictResolution {
          proposer: p.proposal.proposer,
          verdict: p.into_verdict(outcome),
        }
      })
      .collect()
  }

  /// Dedup for verdict blocks arriving from other replicas.
  pub fn adopt_remote(&self, tx_id: &Multihash) -> bool {
    self.state.lock().unwrap().adopted_blocks.insert(*tx_id)
  }

  pub fn pending_len(&self) -> usize {
    self.state.lock().unwrap().pending.len()
  }
}

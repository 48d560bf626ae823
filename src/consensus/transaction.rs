use {
  super::vote::{VoteChoice, VoteSignature},
  crate::{
    detector::AttackKind,
    observation::{AnnouncementType, Observation},
    primitives::{sha256, Asn, Multihash, ToBase58String},
  },
  chrono::{DateTime, Utc},
  ipnet::IpNet,
  serde::{Deserialize, Serialize},
};

/// Whether a transaction records a routine announcement or one the
/// observer's detector classified as an attack. The attack kind
/// rides along so voters can check the proposer's classification
/// against their own detector.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
  Regular,
  Attack(AttackKind),
}

impl TxKind {
  pub fn is_attack(self) -> bool {
    matches!(self, TxKind::Attack(_))
  }
}

/// Lifecycle of a transaction inside a pool.
///
/// A transaction is finalized exactly once; every terminal state is
/// reached either through the commit predicate or the timeout sweep.
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
pub enum TxStatus {
  Pending,
  Committed,
  TimedOutConfirmed,
  TimedOutInsufficient,
  TimedOutSingleWitness,
  Rejected,
}

impl TxStatus {
  /// Terminal states that land the transaction on the chain.
  pub fn commits(self) -> bool {
    matches!(
      self,
      TxStatus::Committed
        | TxStatus::TimedOutConfirmed
        | TxStatus::TimedOutInsufficient
        | TxStatus::TimedOutSingleWitness
    )
  }

  /// States backed by a full Proof-of-Population quorum.
  pub fn confirmed(self) -> bool {
    matches!(self, TxStatus::Committed | TxStatus::TimedOutConfirmed)
  }
}

/// A proposed record of one observed announcement.
///
/// The id is a deterministic content hash, so any two validators
/// describing the same announcement from the same vantage at the
/// same second produce the same transaction identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: Multihash,
  pub observer: Asn,
  pub prefix: IpNet,
  pub origin: Asn,
  pub as_path: Vec<Asn>,
  pub timestamp: f64,
  pub announcement: AnnouncementType,
  pub kind: TxKind,
  pub created_at: DateTime<Utc>,
  pub signatures: Vec<VoteSignature>,
  pub status: TxStatus,
}

impl Transaction {
  /// Deterministic identity over the content fields. Timestamps are
  /// bucketed to whole seconds so jitter below a second does not
  /// split identities.
  pub fn content_id(
    observer: Asn,
    origin: Asn,
    prefix: &IpNet,
    timestamp: f64,
    announcement: AnnouncementType,
  ) -> Multihash {
    let bucket = timestamp.floor() as u64;
    let preimage = bincode::serialize(&(
      observer,
      origin,
      prefix.to_string(),
      bucket,
      announcement.tag(),
    ))
    .expect("tuple of plain values always encodes");
    sha256(&preimage)
  }

  /// Builds a new transaction from an observation, stamped with the
  /// deterministic wall-clock equivalent of its logical timestamp.
  pub fn build(
    observation: &Observation,
    kind: TxKind,
    created_at: DateTime<Utc>,
  ) -> Self {
    let id = Self::content_id(
      observation.source,
      observation.origin,
      &observation.prefix,
      observation.timestamp,
      observation.announcement,
    );
    Self {
      id,
      observer: observation.source,
      prefix: observation.prefix,
      origin: observation.origin,
      as_path: observation.as_path.clone(),
      timestamp: observation.timestamp,
      announcement: observation.announcement,
      kind,
      created_at,
      signatures: vec![],
      status: TxStatus::Pending,
    }
  }

  /// The proposer's own approve ballot, which every well-formed
  /// transaction carries as its first signature.
  pub fn proposer_signature(&self) -> Option<&VoteSignature> {
    self
      .signatures
      .first()
      .filter(|s| s.voter == self.observer && s.choice == VoteChoice::Approve)
  }

  pub fn short_id(&self) -> String {
    let b58 = self.id.to_b58();
    b58.chars().take(8).collect()
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Transaction, TxKind},
    crate::{
      observation::{AnnouncementType, Observation},
      primitives::Asn,
    },
    chrono::{TimeZone, Utc},
  };

  fn observation(timestamp: f64) -> Observation {
    Observation {
      timestamp,
      prefix: "10.0.0.0/24".parse().unwrap(),
      origin: Asn(100),
      as_path: vec![Asn(1), Asn(100)],
      source: Asn(1),
      announcement: AnnouncementType::Announce,
      scenario_id: None,
    }
  }

  #[test]
  fn identity_is_deterministic_and_bucketed() {
    let created = Utc.timestamp_opt(0, 0).unwrap();
    let a = Transaction::build(&observation(10.2), TxKind::Regular, created);
    let b = Transaction::build(&observation(10.9), TxKind::Regular, created);
    let c = Transaction::build(&observation(11.0), TxKind::Regular, created);
    assert_eq!(a.id, b.id);
    assert_ne!(a.id, c.id);
  }

  #[test]
  fn identity_distinguishes_observers() {
    let created = Utc.timestamp_opt(0, 0).unwrap();
    let mut obs = observation(0.0);
    let a = Transaction::build(&obs, TxKind::Regular, created);
    obs.source = Asn(2);
    let b = Transaction::build(&obs, TxKind::Regular, created);
    assert_ne!(a.id, b.id);
  }
}

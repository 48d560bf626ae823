//! In-process message bus.
//!
//! A single router shared by every validator. Each node registers
//! one bounded inbox; sends are synchronous hand-offs that either
//! land in the inbox or are dropped and counted when it is full.
//! There are no retries. Ordering is FIFO per (sender, receiver)
//! pair and nothing more. The bus holds no transaction state, only
//! routing and statistics.

use {
  crate::{
    consensus::{
      Transaction,
      VerdictBallot,
      VerdictProposal,
      VoteSignature,
    },
    chain::CommitSeal,
    primitives::{Asn, KeyRegistry, Keypair},
  },
  dashmap::DashMap,
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
  std::sync::atomic::{AtomicU64, Ordering},
  tokio::sync::mpsc::{channel, Receiver, Sender},
};

/// Everything validators say to each other. Tagged variants, never
/// dynamic payloads; the router and handlers dispatch on the tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
  VoteRequest {
    tx: Transaction,
  },
  VoteResponse {
    tx_id: Multihash,
    vote: VoteSignature,
  },
  AttackProposal {
    proposal: VerdictProposal,
  },
  AttackVote {
    tx_id: Multihash,
    ballot: VerdictBallot,
  },
  BlockCommit {
    seal: CommitSeal,
  },
}

impl Message {
  pub fn kind(&self) -> &'static str {
    match self {
      Message::VoteRequest { .. } => "vote_request",
      Message::VoteResponse { .. } => "vote_response",
      Message::AttackProposal { .. } => "attack_proposal",
      Message::AttackVote { .. } => "attack_vote",
      Message::BlockCommit { .. } => "block_commit",
    }
  }
}

/// A routed message, signed by its sender over the addressed body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub from: Asn,
  pub to: Asn,
  pub message: Message,
  pub signature: Signature,
}

impl Envelope {
  fn signing_bytes(from: Asn, to: Asn, message: &Message) -> Vec<u8> {
    bincode::serialize(&(from, to, message))
      .expect("messages always encode")
  }

  pub fn sign(keypair: &Keypair, from: Asn, to: Asn, message: Message) -> Self {
    let signature = keypair.sign(&Self::signing_bytes(from, to, &message));
    Self {
      from,
      to,
      message,
      signature,
    }
  }

  pub fn verify(&self, registry: &KeyRegistry) -> bool {
    registry.verify(
      self.from,
      &Self::signing_bytes(self.from, self.to, &self.message),
      &self.signature,
    )
  }
}

/// Counters the message-bus statistic outputs are derived from.
#[derive(Debug, Default)]
pub struct BusCounters {
  pub sent: AtomicU64,
  pub delivered: AtomicU64,
  pub dropped: AtomicU64,
  pub unroutable: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BusStats {
  pub sent: u64,
  pub delivered: u64,
  pub dropped: u64,
  pub unroutable: u64,
}

pub struct MessageBus {
  capacity: usize,
  inboxes: DashMap<Asn, Sender<Envelope>>,
  counters: BusCounters,
}

impl MessageBus {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      inboxes: DashMap::new(),
      counters: BusCounters::default(),
    }
  }

  /// Registers `asn`'s inbox and hands back its single consumer.
  pub fn register(&self, asn: Asn) -> Receiver<Envelope> {
    let (tx, rx) = channel(self.capacity);
    self.inboxes.insert(asn, tx);
    rx
  }

  /// Synchronous hand-off into the recipient's inbox. A full inbox
  /// drops the message; the sender observes `false` and moves on.
  pub fn send(&self, envelope: Envelope) -> bool {
    self.counters.sent.fetch_add(1, Ordering::Relaxed);
    let inbox = match self.inboxes.get(&envelope.to) {
      Some(inbox) => inbox,
      None => {
        self.counters.unroutable.fetch_add(1, Ordering::Relaxed);
        return false;
      }
    };
    match inbox.try_send(envelope) {
      Ok(()) => {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        true
      }
      Err(_) => {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        false
      }
    }
  }

  /// Fire-and-forget per peer. Returns (sent, delivered).
  pub fn broadcast(
    &self,
    keypair: &Keypair,
    from: Asn,
    peers: &[Asn],
    message: &Message,
  ) -> (usize, usize) {
    let mut delivered = 0;
    for &peer in peers {
      let envelope =
        Envelope::sign(keypair, from, peer, message.clone());
      if self.send(envelope) {
        delivered += 1;
      }
    }
    (peers.len(), delivered)
  }

  pub fn stats(&self) -> BusStats {
    let c = &self.counters;
    BusStats {
      sent: c.sent.load(Ordering::Relaxed),
      delivered: c.delivered.load(Ordering::Relaxed),
      dropped: c.dropped.load(Ordering::Relaxed),
      unroutable: c.unroutable.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod test {
  use {
    super::{Envelope, Message, MessageBus},
    crate::{
      consensus::{Transaction, TxKind},
      observation::{AnnouncementType, Observation},
      primitives::{Asn, KeyRegistry, Keypair},
    },
    chrono::{TimeZone, Utc},
  };

  fn vote_request(observer: u32) -> Message {
    let obs = Observation {
      timestamp: 0.0,
      prefix: "10.0.0.0/24".parse().unwrap(),
      origin: Asn(100),
      as_path: vec![Asn(observer), Asn(100)],
      source: Asn(observer),
      announcement: AnnouncementType::Announce,
      scenario_id: None,
    };
    Message::VoteRequest {
      tx: Transaction::build(
        &obs,
        TxKind::Regular,
        Utc.timestamp_opt(0, 0).unwrap(),
      ),
    }
  }

  #[tokio::test]
  async fn delivers_in_order_per_pair() {
    let bus = MessageBus::new(16);
    let kp = Keypair::derive(0, Asn(1));
    let mut inbox = bus.register(Asn(2));

    for _ in 0..3 {
      assert!(bus.send(Envelope::sign(
        &kp,
        Asn(1),
        Asn(2),
        vote_request(1),
      )));
    }
    for _ in 0..3 {
      let envelope = inbox.recv().await.unwrap();
      assert_eq!(envelope.from, Asn(1));
    }
    assert_eq!(bus.stats().delivered, 3);
  }

  #[tokio::test]
  async fn overflow_drops_and_counts() {
    let bus = MessageBus::new(2);
    let kp = Keypair::derive(0, Asn(1));
    let _inbox = bus.register(Asn(2));

    assert!(bus.send(Envelope::sign(&kp, Asn(1), Asn(2), vote_request(1))));
    assert!(bus.send(Envelope::sign(&kp, Asn(1), Asn(2), vote_request(1))));
    // inbox full: dropped, not queued
    assert!(!bus.send(Envelope::sign(&kp, Asn(1), Asn(2), vote_request(1))));

    let stats = bus.stats();
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dropped, 1);
  }

  #[tokio::test]
  async fn unknown_recipient_is_unroutable() {
    let bus = MessageBus::new(4);
    let kp = Keypair::derive(0, Asn(1));
    assert!(!bus.send(Envelope::sign(&kp, Asn(1), Asn(9), vote_request(1))));
    assert_eq!(bus.stats().unroutable, 1);
  }

  #[test]
  fn envelopes_authenticate_their_sender() {
    let registry = KeyRegistry::new();
    let kp = Keypair::derive(0, Asn(1));
    registry.register_keypair(Asn(1), &kp);

    let envelope = Envelope::sign(&kp, Asn(1), Asn(2), vote_request(1));
    assert!(envelope.verify(&registry));

    // a re-addressed envelope no longer verifies
    let mut forged = envelope.clone();
    forged.to = Asn(3);
    assert!(!forged.verify(&registry));

    // neither does an impersonated sender
    let mut forged = envelope;
    forged.from = Asn(2);
    assert!(!forged.verify(&registry));
  }
}

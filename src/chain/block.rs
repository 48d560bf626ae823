use {
  crate::{
    consensus::{AttackVerdict, Transaction},
    primitives::{merkle_root, sha256, zero_hash, Asn, KeyRegistry, Keypair},
  },
  chrono::{DateTime, Utc},
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
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
pub enum BlockType {
  Genesis,
  Transaction,
  Verdict,
}

/// What a block carries: one committed transaction or one confirmed
/// attack verdict. Single-payload blocks keep commit latency low;
/// the Merkle root is still computed over the payload list so blocks
/// can batch later without changing the chain format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPayload {
  Genesis,
  Transaction(Transaction),
  Verdict(AttackVerdict),
}

impl BlockPayload {
  pub fn block_type(&self) -> BlockType {
    match self {
      BlockPayload::Genesis => BlockType::Genesis,
      BlockPayload::Transaction(_) => BlockType::Transaction,
      BlockPayload::Verdict(_) => BlockType::Verdict,
    }
  }

  pub fn hash(&self) -> Multihash {
    let encoded =
      bincode::serialize(self).expect("payloads always encode");
    sha256(&encoded)
  }
}

/// A committer's signed announcement of a committed payload.
///
/// The signature covers the payload digest, merkle root, committer
/// and timestamp but not the chain linkage, so every replica can
/// adopt the same seal onto its own tip. Replicas fed identical
/// inputs still produce bit-identical blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSeal {
  pub payload: BlockPayload,
  pub committer: Asn,
  pub timestamp: DateTime<Utc>,
  pub signature: Signature,
}

impl CommitSeal {
  fn signing_bytes(
    payload_hash: &Multihash,
    merkle: &Multihash,
    committer: Asn,
    timestamp: &DateTime<Utc>,
  ) -> Vec<u8> {
    let mut msg = payload_hash.to_bytes();
    msg.extend_from_slice(&merkle.to_bytes());
    msg.extend_from_slice(&committer.to_le_bytes());
    msg.extend_from_slice(&timestamp.timestamp_millis().to_le_bytes());
    msg
  }

  pub fn new(
    keypair: &Keypair,
    payload: BlockPayload,
    committer: Asn,
    timestamp: DateTime<Utc>,
  ) -> Self {
    let payload_hash = payload.hash();
    let merkle = merkle_root(&[payload_hash]);
    let signature = keypair.sign(&Self::signing_bytes(
      &payload_hash,
      &merkle,
      committer,
      &timestamp,
    ));
    Self {
      payload,
      committer,
      timestamp,
      signature,
    }
  }

  pub fn verify(&self, registry: &KeyRegistry) -> bool {
    let payload_hash = self.payload.hash();
    let merkle = merkle_root(&[payload_hash]);
    registry.verify(
      self.committer,
      &Self::signing_bytes(
        &payload_hash,
        &merkle,
        self.committer,
        &self.timestamp,
      ),
      &self.signature,
    )
  }
}

/// One link of a replica's hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
  pub height: u64,
  pub block_type: BlockType,
  pub payload: BlockPayload,
  pub prev_hash: Multihash,
  pub merkle_root: Multihash,
  pub timestamp: DateTime<Utc>,
  pub committer: Asn,
  pub signature: Signature,
}

impl Block {
  /// The fixed first block of every replica. The zero committer and
  /// zero signature mark that nobody produced it.
  pub fn genesis(timestamp: DateTime<Utc>) -> Self {
    let payload = BlockPayload::Genesis;
    let merkle = merkle_root(&[payload.hash()]);
    Self {
      height: 0,
      block_type: BlockType::Genesis,
      payload,
      prev_hash: zero_hash(),
      merkle_root: merkle,
      timestamp,
      committer: Asn(0),
      signature: Signature::from_bytes(&[0u8; 64])
        .expect("the zero signature is well-formed"),
    }
  }

  /// Links a sealed payload onto a local tip.
  pub fn from_seal(height: u64, prev_hash: Multihash, seal: CommitSeal) -> Self {
    let merkle = merkle_root(&[seal.payload.hash()]);
    Self {
      height,
      block_type: seal.payload.block_type(),
      payload: seal.payload,
      prev_hash,
      merkle_root: merkle,
      timestamp: seal.timestamp,
      committer: seal.committer,
      signature: seal.signature,
    }
  }

  /// `SHA-256(height || prev_hash || merkle_root || timestamp ||
  /// committer || payload_hash)`.
  pub fn hash(&self) -> Multihash {
    let mut msg = self.height.to_le_bytes().to_vec();
    msg.extend_from_slice(&self.prev_hash.to_bytes());
    msg.extend_from_slice(&self.merkle_root.to_bytes());
    msg.extend_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
    msg.extend_from_slice(&self.committer.to_le_bytes());
    msg.extend_from_slice(&self.payload.hash().to_bytes());
    sha256(&msg)
  }

  pub fn verify_signature(&self, registry: &KeyRegistry) -> bool {
    registry.verify(
      self.committer,
      &CommitSeal::signing_bytes(
        &self.payload.hash(),
        &self.merkle_root,
        self.committer,
        &self.timestamp,
      ),
      &self.signature,
    )
  }
}

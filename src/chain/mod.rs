//! Per-replica append-only hash chain.
//!
//! Every validator keeps its own replica. Appends are serialized by
//! a write lock and persisted before the in-memory tip moves, so a
//! failed disk write never leaves a link the rest of the system
//! believes in. Readers take the read side.

mod block;

pub use block::{Block, BlockPayload, BlockType, CommitSeal};

use {
  crate::{
    primitives::{merkle_root, zero_hash, KeyRegistry, ToBase58String},
    storage::{BlockStore, StorageError},
  },
  chrono::{DateTime, Utc},
  serde::Serialize,
  std::sync::RwLock,
  thiserror::Error,
  tracing::warn,
};

#[derive(Debug, Error)]
pub enum ChainError {
  #[error("block persistence failed twice, append aborted: {0}")]
  Persistence(#[from] StorageError),
}

/// One discrepancy found by full-chain verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFault {
  WrongGenesisParent,
  BrokenLink { height: u64 },
  WrongMerkleRoot { height: u64 },
  NonMonotonicHeight { height: u64 },
  BadSignature { height: u64 },
}

pub struct Blockchain {
  blocks: RwLock<Vec<Block>>,
  store: Option<BlockStore>,
}

impl Blockchain {
  /// A fresh in-memory replica starting at genesis.
  pub fn new(genesis_time: DateTime<Utc>) -> Self {
    Self {
      blocks: RwLock::new(vec![Block::genesis(genesis_time)]),
      store: None,
    }
  }

  /// A persistent replica. An existing store is recovered as-is so
  /// a crashed run resumes from its last appended block; an empty
  /// one is seeded with genesis.
  pub fn with_store(
    genesis_time: DateTime<Utc>,
    store: BlockStore,
  ) -> Result<Self, ChainError> {
    let mut blocks = store.load()?;
    if blocks.is_empty() {
      let genesis = Block::genesis(genesis_time);
      store.put(&genesis)?;
      blocks.push(genesis);
    }
    Ok(Self {
      blocks: RwLock::new(blocks),
      store: Some(store),
    })
  }

  /// Links a sealed payload onto the tip, persists it and publishes
  /// the new block. Persistence is retried once; a second failure
  /// aborts the append and the caller rolls the transaction back.
  pub fn append(&self, seal: CommitSeal) -> Result<Block, ChainError> {
    let mut blocks = self.blocks.write().unwrap();
    let tip = blocks.last().expect("chains always hold genesis");
    let block = Block::from_seal(tip.height + 1, tip.hash(), seal);

    if let Some(store) = &self.store {
      if let Err(first) = store.put(&block) {
        warn!(
          "retrying block {} persistence after: {first}",
          block.height
        );
        store.put(&block)?;
      }
    }

    blocks.push(block.clone());
    Ok(block)
  }

  pub fn tip(&self) -> Block {
    self
      .blocks
      .read()
      .unwrap()
      .last()
      .expect("chains always hold genesis")
      .clone()
  }

  pub fn get(&self, height: u64) -> Option<Block> {
    self.blocks.read().unwrap().get(height as usize).cloned()
  }

  /// Height of the tip block.
  pub fn height(&self) -> u64 {
    self.blocks.read().unwrap().len() as u64 - 1
  }

  pub fn blocks(&self) -> Vec<Block> {
    self.blocks.read().unwrap().clone()
  }

  pub fn tip_hash_b58(&self) -> String {
    self.tip().hash().to_b58()
  }

  /// Recomputes every hash link, merkle root and (when a registry is
  /// given) committer signature, returning all mismatches.
  pub fn verify_full_chain(
    &self,
    registry: Option<&KeyRegistry>,
  ) -> Vec<ChainFault> {
    let blocks = self.blocks.read().unwrap();
    let mut faults = vec![];

    for (idx, block) in blocks.iter().enumerate() {
      if block.height != idx as u64 {
        faults.push(ChainFault::NonMonotonicHeight {
          height: block.height,
        });
      }
      if block.merkle_root != merkle_root(&[block.payload.hash()]) {
        faults.push(ChainFault::WrongMerkleRoot {
          height: block.height,
        });
      }
      if idx == 0 {
        if block.prev_hash != zero_hash() {
          faults.push(ChainFault::WrongGenesisParent);
        }
        continue;
      }
      if block.prev_hash != blocks[idx - 1].hash() {
        faults.push(ChainFault::BrokenLink {
          height: block.height,
        });
      }
      if let Some(registry) = registry {
        if !block.verify_signature(registry) {
          faults.push(ChainFault::BadSignature {
            height: block.height,
          });
        }
      }
    }

    faults
  }
}

use {
  crate::chain::Block,
  std::path::Path,
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage engine error: {0}")]
  Db(#[from] sled::Error),

  #[error("block encoding error: {0}")]
  Codec(#[from] bincode::Error),
}

/// Crash-recoverable block persistence for one replica.
///
/// Blocks are bincode-encoded under their big-endian height so the
/// natural key order of the tree is chain order, the same trick the
/// in-memory tip relies on after recovery.
pub struct BlockStore {
  _db: sled::Db,
  tree: sled::Tree,
}

impl BlockStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
    let db = sled::open(path)?;
    let tree = db.open_tree("blocks")?;
    Ok(Self { _db: db, tree })
  }

  pub fn put(&self, block: &Block) -> Result<(), StorageError> {
    self.tree.insert(
      block.height.to_be_bytes(), // big endian for lexicographic order
      bincode::serialize(block)?,
    )?;
    self.tree.flush()?;
    Ok(())
  }

  /// Reads the whole chain back in height order.
  pub fn load(&self) -> Result<Vec<Block>, StorageError> {
    let mut blocks = vec![];
    for entry in self.tree.iter() {
      let (_, value) = entry?;
      blocks.push(bincode::deserialize(&value)?);
    }
    Ok(blocks)
  }
}

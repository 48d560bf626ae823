mod asn;
mod b58;
mod hash;
mod keys;
mod registry;

pub use {
  asn::Asn,
  b58::ToBase58String,
  hash::{merkle_root, sha256, zero_hash, Multihash},
  keys::{Keypair, KeypairError, Pubkey},
  registry::KeyRegistry,
};

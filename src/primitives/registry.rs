use {
  super::{Asn, Keypair, Pubkey},
  dashmap::DashMap,
  ed25519_dalek::{PublicKey, Signature, Verifier},
};

/// Process-wide registry of validator public keys, keyed by ASN.
///
/// Populated once at startup when validator keypairs are derived and
/// read-only afterwards. Verification against an unregistered ASN
/// fails closed: callers treat a `false` result as a reject.
#[derive(Debug, Default)]
pub struct KeyRegistry {
  keys: DashMap<Asn, Pubkey>,
}

impl KeyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, asn: Asn, pubkey: Pubkey) {
    self.keys.insert(asn, pubkey);
  }

  pub fn register_keypair(&self, asn: Asn, keypair: &Keypair) {
    self.register(asn, keypair.public());
  }

  pub fn pubkey(&self, asn: Asn) -> Option<Pubkey> {
    self.keys.get(&asn).map(|k| *k)
  }

  pub fn contains(&self, asn: Asn) -> bool {
    self.keys.contains_key(&asn)
  }

  /// Verifies `signature` over `message` against the key registered
  /// for `asn`. Unknown ASNs and malformed keys verify as false.
  pub fn verify(&self, asn: Asn, message: &[u8], signature: &Signature) -> bool {
    let pubkey = match self.keys.get(&asn) {
      Some(k) => *k,
      None => return false,
    };
    let pubkey: PublicKey = match (&pubkey).try_into() {
      Ok(k) => k,
      Err(_) => return false,
    };
    pubkey.verify(message, signature).is_ok()
  }
}

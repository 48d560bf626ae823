use {
  super::{sha256, Asn},
  ed25519_dalek::{PublicKey, SecretKey},
  serde::{
    de::{self, Visitor},
    Deserialize,
    Deserializer,
    Serialize,
  },
  std::{
    fmt::{Debug, Display, Formatter},
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

/// The Ed25519 public key of a validator.
///
/// Validators sign every vote, verdict ballot and committed block;
/// observed (non-validator) ASes never hold a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Deref for Pubkey {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", bs58::encode(self.0).into_string())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", bs58::encode(self.0).into_string())
  }
}

impl From<Pubkey> for String {
  fn from(pk: Pubkey) -> Self {
    bs58::encode(pk.0).into_string()
  }
}

impl FromStr for Pubkey {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl TryFrom<&Pubkey> for PublicKey {
  type Error = ed25519_dalek::ed25519::Error;

  fn try_from(pk: &Pubkey) -> Result<Self, Self::Error> {
    PublicKey::from_bytes(&pk.0)
  }
}

/// An Ed25519 keypair owned by one validator for the lifetime
/// of a run.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  pub fn secret(&self) -> &SecretKey {
    &self.0.secret
  }

  /// Derives the keypair of a validator deterministically from the
  /// run seed. Replays of the same dataset with the same seed then
  /// reproduce identical signatures, and with them identical chains.
  pub fn derive(seed: u64, asn: Asn) -> Self {
    let mut material = seed.to_le_bytes().to_vec();
    material.extend_from_slice(&asn.to_le_bytes());
    let digest = sha256(&material);
    let secret = SecretKey::from_bytes(digest.digest())
      .expect("a 32-byte digest is a well-formed ed25519 secret");
    let public: PublicKey = (&secret).into();
    Self(ed25519_dalek::Keypair { secret, public })
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes()).unwrap())
  }
}

impl Deref for Keypair {
  type Target = ed25519_dalek::Keypair;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair").field(&self.0.public).finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Keypair({})",
      bs58::encode(self.0.public.as_bytes()).into_string()
    )
  }
}

impl From<ed25519_dalek::Keypair> for Keypair {
  fn from(k: ed25519_dalek::Keypair) -> Self {
    Self(k)
  }
}

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("Failed parsing base58 string: {0:?}")]
  Base58ParseError(bs58::decode::Error),

  #[error("{0}")]
  Ed25519Error(#[from] ed25519_dalek::ed25519::Error),
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeypairError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    let mut secret = [0u8; 32];
    bs58::decode(value)
      .into(&mut secret)
      .map_err(KeypairError::Base58ParseError)?;
    let secret = SecretKey::from_bytes(&secret)?;
    let public = (&secret).into();
    Ok(Keypair(ed25519_dalek::Keypair { secret, public }))
  }
}

/// Deserialize a pubkey from either a user-friendly base58
/// representation or a machine-friendly byte array.
impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct StringOrArray<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrArray<T>
    where
      T: Deserialize<'de> + FromStr<Err = bs58::decode::Error>,
    {
      type Value = T;

      fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("base58 string or byte array")
      }

      fn visit_str<E>(self, value: &str) -> Result<T, E>
      where
        E: de::Error,
      {
        FromStr::from_str(value)
          .map_err(|e| de::Error::custom(format!("{e:?}")))
      }

      fn visit_seq<A>(self, seq: A) -> Result<Self::Value, A::Error>
      where
        A: de::SeqAccess<'de>,
      {
        Deserialize::deserialize(de::value::SeqAccessDeserializer::new(seq))
      }
    }

    deserializer.deserialize_str(StringOrArray(PhantomData))
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&bs58::encode(self.0).into_string())
  }
}

#[cfg(test)]
mod test {
  use {
    super::Keypair,
    crate::primitives::Asn,
    ed25519_dalek::{Signer, Verifier},
  };

  #[test]
  fn derive_is_deterministic() {
    let a = Keypair::derive(7, Asn(65001));
    let b = Keypair::derive(7, Asn(65001));
    assert_eq!(a.public(), b.public());

    let c = Keypair::derive(7, Asn(65002));
    assert_ne!(a.public(), c.public());

    let d = Keypair::derive(8, Asn(65001));
    assert_ne!(a.public(), d.public());
  }

  #[test]
  fn sign_verify_roundtrip() {
    let kp = Keypair::derive(1, Asn(3));
    let sig = kp.sign(b"announcement");
    let public: ed25519_dalek::PublicKey =
      (&kp.public()).try_into().unwrap();
    assert!(public.verify(b"announcement", &sig).is_ok());
    assert!(public.verify(b"tampered", &sig).is_err());
  }
}

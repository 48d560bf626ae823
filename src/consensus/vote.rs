use {
  crate::primitives::{Asn, KeyRegistry, Keypair},
  ed25519_dalek::{Signature, Signer},
  multihash::Multihash,
  serde::{Deserialize, Serialize},
};

/// The three-way ballot a validator casts over a transaction.
///
/// `Approve` means "I also observed this announcement, or I can
/// validate it against the RPKI table". `NoKnowledge` means the
/// voter has nothing to add either way. `Reject` means the voter
/// holds contradicting evidence. The three values are deliberately
/// a tagged enum and never collapse into booleans.
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
pub enum VoteChoice {
  Approve,
  NoKnowledge,
  Reject,
}

impl VoteChoice {
  pub fn tag(self) -> u8 {
    match self {
      VoteChoice::Approve => 0,
      VoteChoice::NoKnowledge => 1,
      VoteChoice::Reject => 2,
    }
  }
}

/// A ballot bound to a transaction by an Ed25519 signature over
/// the transaction id and the choice tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSignature {
  pub voter: Asn,
  pub choice: VoteChoice,
  pub signature: Signature,
}

impl VoteSignature {
  fn signing_bytes(tx_id: &Multihash, choice: VoteChoice) -> Vec<u8> {
    let mut msg = tx_id.to_bytes();
    msg.push(choice.tag());
    msg
  }

  pub fn sign(
    keypair: &Keypair,
    voter: Asn,
    tx_id: &Multihash,
    choice: VoteChoice,
  ) -> Self {
    let signature = keypair.sign(&Self::signing_bytes(tx_id, choice));
    Self {
      voter,
      choice,
      signature,
    }
  }

  pub fn verify(&self, registry: &KeyRegistry, tx_id: &Multihash) -> bool {
    registry.verify(
      self.voter,
      &Self::signing_bytes(tx_id, self.choice),
      &self.signature,
    )
  }
}

#[cfg(test)]
mod test {
  use {
    super::{VoteChoice, VoteSignature},
    crate::primitives::{sha256, Asn, KeyRegistry, Keypair},
  };

  #[test]
  fn ballot_binds_to_tx_and_choice() {
    let registry = KeyRegistry::new();
    let kp = Keypair::derive(0, Asn(3));
    registry.register_keypair(Asn(3), &kp);

    let tx_id = sha256(b"tx");
    let vote =
      VoteSignature::sign(&kp, Asn(3), &tx_id, VoteChoice::Approve);
    assert!(vote.verify(&registry, &tx_id));

    // same signature does not carry over to another transaction
    let other = sha256(b"other-tx");
    assert!(!vote.verify(&registry, &other));

    // nor to a different choice
    let mut flipped = vote;
    flipped.choice = VoteChoice::Reject;
    assert!(!flipped.verify(&registry, &tx_id));
  }
}

use {
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display, Formatter},
    num::ParseIntError,
    str::FromStr,
  },
};

/// An Autonomous System Number.
///
/// ASNs identify every participant in the system: validators that
/// run the full observation pipeline as well as the observed ASes
/// whose announcements are being audited.
#[derive(
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct Asn(pub u32);

impl Asn {
  pub fn to_le_bytes(self) -> [u8; 4] {
    self.0.to_le_bytes()
  }
}

impl Display for Asn {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "AS{}", self.0)
  }
}

impl Debug for Asn {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "AS{}", self.0)
  }
}

impl From<u32> for Asn {
  fn from(n: u32) -> Self {
    Self(n)
  }
}

impl FromStr for Asn {
  type Err = ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let digits = s.strip_prefix("AS").unwrap_or(s);
    Ok(Self(digits.parse()?))
  }
}

#[cfg(test)]
mod test {
  use super::Asn;

  #[test]
  fn parse_with_and_without_prefix() {
    assert_eq!("AS65001".parse::<Asn>().unwrap(), Asn(65001));
    assert_eq!("65001".parse::<Asn>().unwrap(), Asn(65001));
    assert!("ASx".parse::<Asn>().is_err());
  }
}

//! Read-only RPKI validation oracle.
//!
//! Built once at startup from the VRP table and never written again,
//! so lookups are lock-free and safe to share across every node.

use {
  crate::primitives::Asn,
  ipnet::IpNet,
  serde::{Deserialize, Serialize},
  std::collections::HashSet,
};

/// Outcome of validating a (prefix, origin) pair against the VRPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteValidity {
  Valid,
  Invalid,
  NotFound,
}

/// One Validated ROA Payload entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VrpEntry {
  pub prefix: IpNet,
  pub max_length: u8,
  #[serde(rename = "origin_asn")]
  pub origin: Asn,
}

/// Immutable lookup over the VRP table.
#[derive(Debug, Default)]
pub struct RpkiOracle {
  entries: Vec<VrpEntry>,
  exact: HashSet<IpNet>,
}

impl RpkiOracle {
  pub fn new(entries: Vec<VrpEntry>) -> Self {
    let exact = entries.iter().map(|entry| entry.prefix).collect();
    Self { entries, exact }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Validates an announced (prefix, origin) pair.
  ///
  /// `Valid` when some VRP covers the prefix with a matching origin
  /// and a permissible max-length. `Invalid` when a VRP exists for
  /// this exact prefix but no covering entry authorizes the origin.
  /// `NotFound` when nothing in the table speaks for the prefix.
  pub fn validate(&self, prefix: &IpNet, origin: Asn) -> RouteValidity {
    for entry in &self.entries {
      if entry.origin == origin
        && entry.prefix.contains(prefix)
        && prefix.prefix_len() <= entry.max_length
      {
        return RouteValidity::Valid;
      }
    }
    if self.exact.contains(prefix) {
      return RouteValidity::Invalid;
    }
    RouteValidity::NotFound
  }

  /// Looks for a ROA on a covering, strictly shorter prefix whose
  /// origin differs from the announced one. The detector reads a hit
  /// as a sub-prefix hijack of that ROA holder's address space.
  pub fn covering_conflict(
    &self,
    prefix: &IpNet,
    origin: Asn,
  ) -> Option<&VrpEntry> {
    self.entries.iter().find(|entry| {
      entry.origin != origin
        && entry.prefix.prefix_len() < prefix.prefix_len()
        && entry.prefix.contains(prefix)
    })
  }
}

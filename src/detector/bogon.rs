use {ipnet::IpNet, once_cell::sync::Lazy};

/// IANA reserved and special-use ranges that must never appear in
/// the global table: RFC 1918 and RFC 6598 private space, the
/// documentation nets, loopback and multicast. The default route is
/// handled separately since it covers everything.
static RESERVED: Lazy<Vec<IpNet>> = Lazy::new(|| {
  [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
    "192.0.2.0/24",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "127.0.0.0/8",
    "224.0.0.0/4",
    "::1/128",
    "2001:db8::/32",
    "ff00::/8",
  ]
  .iter()
  .map(|p| p.parse().expect("static reserved ranges parse"))
  .collect()
});

/// True when announcing `prefix` can only be an error or an attack.
pub fn is_bogon(prefix: &IpNet) -> bool {
  if prefix.prefix_len() == 0 {
    // announcing a default route
    return true;
  }
  RESERVED.iter().any(|reserved| reserved.contains(prefix))
}

#[cfg(test)]
mod test {
  use super::is_bogon;

  #[test]
  fn reserved_ranges_are_bogons() {
    for prefix in [
      "10.1.2.0/24",
      "172.20.0.0/16",
      "192.168.1.0/24",
      "192.0.2.0/24",
      "127.0.0.0/8",
      "224.1.0.0/16",
      "0.0.0.0/0",
      "2001:db8:1::/48",
    ] {
      assert!(is_bogon(&prefix.parse().unwrap()), "{prefix}");
    }
  }

  #[test]
  fn global_unicast_is_not_a_bogon() {
    for prefix in ["8.8.8.0/24", "1.1.1.0/24", "2600::/32"] {
      assert!(!is_bogon(&prefix.parse().unwrap()), "{prefix}");
    }
  }
}

use {
  crate::primitives::Asn,
  ipnet::IpNet,
  serde::{Deserialize, Serialize},
};

/// Whether an observation records an announcement or a withdrawal.
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
pub enum AnnouncementType {
  Announce,
  Withdraw,
}

impl AnnouncementType {
  pub fn tag(self) -> u8 {
    match self {
      AnnouncementType::Announce => 0,
      AnnouncementType::Withdraw => 1,
    }
  }
}

/// One BGP announcement or withdrawal as seen at some vantage AS.
///
/// Observations are the input events of the whole pipeline. They are
/// immutable; timestamps are logical seconds since the dataset epoch
/// and drive all sampling windows, which keeps replays of the same
/// dataset deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
  pub timestamp: f64,
  pub prefix: IpNet,
  #[serde(rename = "origin_asn")]
  pub origin: Asn,
  pub as_path: Vec<Asn>,
  #[serde(rename = "source_asn")]
  pub source: Asn,
  #[serde(rename = "announcement_type")]
  pub announcement: AnnouncementType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub scenario_id: Option<String>,
}

#[cfg(test)]
mod test {
  use super::Observation;

  #[test]
  fn parses_dataset_record() {
    let record = r#"{
      "timestamp": 12.5,
      "prefix": "10.0.0.0/24",
      "origin_asn": 100,
      "as_path": [1, 7, 100],
      "source_asn": 1,
      "announcement_type": "announce"
    }"#;
    let obs: Observation = serde_json::from_str(record).unwrap();
    assert_eq!(obs.origin.0, 100);
    assert_eq!(obs.as_path.len(), 3);
    assert!(obs.scenario_id.is_none());
  }
}

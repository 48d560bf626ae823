//! Dataset input.
//!
//! Three read-only inputs drive a run: the AS roster (who is a
//! validator), the VRP table for the oracle, and one observation
//! file per AS. Individual malformed records are counted and
//! skipped; a missing or unparsable top-level file aborts startup
//! before any node runs.

use {
  crate::{
    node::Role,
    observation::Observation,
    oracle::VrpEntry,
    primitives::Asn,
  },
  rayon::prelude::*,
  serde::{Deserialize, Serialize},
  std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
  },
  thiserror::Error,
  tracing::warn,
};

#[derive(Debug, Error)]
pub enum DatasetError {
  #[error("failed reading {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("failed parsing {path}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },

  #[error("dataset has no validators")]
  NoValidators,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
  pub is_rpki_validator: bool,
  pub role: Role,
}

#[derive(Debug)]
pub struct Dataset {
  pub roster: BTreeMap<Asn, NodeSpec>,
  pub vrp: Vec<VrpEntry>,
  pub observations: HashMap<Asn, Vec<Observation>>,
  pub malformed_records: u64,
}

impl Dataset {
  pub fn validators(&self) -> Vec<Asn> {
    self
      .roster
      .iter()
      .filter(|(_, spec)| spec.role == Role::Validator)
      .map(|(asn, _)| *asn)
      .collect()
  }
}

fn read_json<T: serde::de::DeserializeOwned>(
  path: &Path,
) -> Result<T, DatasetError> {
  let contents =
    std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
      path: path.to_owned(),
      source,
    })?;
  serde_json::from_str(&contents).map_err(|source| DatasetError::Parse {
    path: path.to_owned(),
    source,
  })
}

/// Loads a dataset directory: `roster.json`, `vrp.json` and the
/// `observations/` directory holding one `<asn>.json` array per AS.
pub fn load(dir: impl AsRef<Path>) -> Result<Dataset, DatasetError> {
  let dir = dir.as_ref();

  let roster: BTreeMap<Asn, NodeSpec> = read_json(&dir.join("roster.json"))?;
  if !roster.values().any(|spec| spec.role == Role::Validator) {
    return Err(DatasetError::NoValidators);
  }
  let vrp: Vec<VrpEntry> = read_json(&dir.join("vrp.json"))?;

  let observation_files: Vec<(Asn, PathBuf)> = roster
    .keys()
    .map(|&asn| {
      (asn, dir.join("observations").join(format!("{}.json", asn.0)))
    })
    .filter(|(_, path)| path.exists())
    .collect();

  let parsed: Vec<(Asn, Vec<Observation>, u64)> = observation_files
    .par_iter()
    .map(|(asn, path)| {
      let records: Vec<serde_json::Value> = match read_json(path) {
        Ok(records) => records,
        Err(err) => {
          warn!("skipping observation file for {asn}: {err}");
          return (*asn, vec![], 1);
        }
      };
      let mut observations = Vec::with_capacity(records.len());
      let mut malformed = 0;
      for record in records {
        match serde_json::from_value::<Observation>(record) {
          Ok(observation) => observations.push(observation),
          Err(err) => {
            malformed += 1;
            warn!("dropping malformed observation for {asn}: {err}");
          }
        }
      }
      // inputs are sorted by timestamp already; enforce it anyway
      observations
        .sort_by(|a, b| a.timestamp.partial_cmp(&b.timestamp).unwrap());
      (*asn, observations, malformed)
    })
    .collect();

  let mut observations = HashMap::new();
  let mut malformed_records = 0;
  for (asn, parsed, malformed) in parsed {
    malformed_records += malformed;
    observations.insert(asn, parsed);
  }

  Ok(Dataset {
    roster,
    vrp,
    observations,
    malformed_records,
  })
}

#[cfg(test)]
mod test {
  use {super::load, std::fs};

  #[test]
  fn loads_a_directory_and_counts_malformed_records() {
    let dir = std::env::temp_dir()
      .join(format!("bgp-sentry-dataset-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(dir.join("observations")).unwrap();

    fs::write(
      dir.join("roster.json"),
      r#"{
        "1": {"is_rpki_validator": true, "role": "validator"},
        "100": {"is_rpki_validator": false, "role": "observed"}
      }"#,
    )
    .unwrap();
    fs::write(
      dir.join("vrp.json"),
      r#"[{"prefix": "10.0.0.0/24", "max_length": 24, "origin_asn": 100}]"#,
    )
    .unwrap();
    fs::write(
      dir.join("observations").join("1.json"),
      r#"[
        {"timestamp": 5.0, "prefix": "10.0.0.0/24", "origin_asn": 100,
         "as_path": [1, 100], "source_asn": 1,
         "announcement_type": "announce"},
        {"timestamp": 1.0, "prefix": "10.0.0.0/24", "origin_asn": 100,
         "as_path": [1, 100], "source_asn": 1,
         "announcement_type": "announce"},
        {"timestamp": "not-a-number"}
      ]"#,
    )
    .unwrap();

    let dataset = load(&dir).unwrap();
    assert_eq!(dataset.validators().len(), 1);
    assert_eq!(dataset.vrp.len(), 1);
    assert_eq!(dataset.malformed_records, 1);

    let observations = &dataset.observations[&crate::primitives::Asn(1)];
    assert_eq!(observations.len(), 2);
    // re-sorted by timestamp
    assert_eq!(observations[0].timestamp, 1.0);

    let _ = fs::remove_dir_all(&dir);
  }

  #[test]
  fn roster_without_validators_is_fatal() {
    let dir = std::env::temp_dir()
      .join(format!("bgp-sentry-novalid-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
      dir.join("roster.json"),
      r#"{"100": {"is_rpki_validator": false, "role": "observed"}}"#,
    )
    .unwrap();
    fs::write(dir.join("vrp.json"), "[]").unwrap();

    assert!(load(&dir).is_err());
    let _ = fs::remove_dir_all(&dir);
  }
}

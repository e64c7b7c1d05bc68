//! Calibration-derived mappings: serializable records, validation, and the
//! shared store the detection engines read every tick.
//!
//! File format: one JSON object keyed by action name. Finger entries are
//! `{key, rest, half, full, crosstalk_ref}`, strum entries are
//! `{key_prefix, vector: {gx, gy, gz}, threshold}`.

use crate::types::{Action, Vec3};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const DEFAULT_MAPPING_FILE: &str = "sensor_mappings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FingerMapping {
    #[serde(rename = "key")]
    pub sensor_key: String,
    #[serde(rename = "rest")]
    pub rest_value: f64,
    pub half: f64,
    #[serde(rename = "full")]
    pub full_value: f64,
    /// Every other flex channel, recorded while this finger was fully bent.
    #[serde(rename = "crosstalk_ref")]
    pub crosstalk_reference: BTreeMap<String, f64>,
}

impl FingerMapping {
    pub fn range(&self) -> f64 {
        self.full_value - self.rest_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrumMapping {
    #[serde(rename = "key_prefix")]
    pub axis_prefix: String,
    /// Angular velocity at the peak of the calibration swing (a down-strum)
    #[serde(rename = "vector")]
    pub reference: Vec3,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mapping {
    Finger(FingerMapping),
    Strum(StrumMapping),
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("{action}: malformed entry: {source}")]
    Malformed {
        action: String,
        source: serde_json::Error,
    },
    #[error("{action}: entry kind does not match action")]
    KindMismatch { action: Action },
    #[error("{action}: rest and full are both {value}")]
    DegenerateRange { action: Action, value: f64 },
    #[error("{action}: non-finite value")]
    NonFinite { action: Action },
    #[error("{action}: reference vector has zero magnitude")]
    ZeroVector { action: Action },
    #[error("{action}: threshold {threshold} must be positive")]
    BadThreshold { action: Action, threshold: f64 },
    #[error("mapping document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("mapping file: {0}")]
    Io(#[from] io::Error),
}

impl Mapping {
    /// Check the entry is usable for `action`. Rejects anything that would
    /// divide by zero or never trigger at detection time.
    pub fn validate(&self, action: Action) -> Result<(), MappingError> {
        match (action, self) {
            (Action::Finger(_), Mapping::Finger(m)) => {
                let all_finite = [m.rest_value, m.half, m.full_value]
                    .iter()
                    .chain(m.crosstalk_reference.values())
                    .all(|v| v.is_finite());
                if !all_finite {
                    return Err(MappingError::NonFinite { action });
                }
                if m.rest_value == m.full_value {
                    return Err(MappingError::DegenerateRange {
                        action,
                        value: m.rest_value,
                    });
                }
                Ok(())
            }
            (Action::Strum(_), Mapping::Strum(m)) => {
                if !m.reference.is_finite() || !m.threshold.is_finite() {
                    return Err(MappingError::NonFinite { action });
                }
                if m.reference.magnitude() <= f64::EPSILON {
                    return Err(MappingError::ZeroVector { action });
                }
                if m.threshold <= 0.0 {
                    return Err(MappingError::BadThreshold {
                        action,
                        threshold: m.threshold,
                    });
                }
                Ok(())
            }
            _ => Err(MappingError::KindMismatch { action }),
        }
    }

    /// Channel key or axis prefix, for status display.
    pub fn source_key(&self) -> &str {
        match self {
            Mapping::Finger(m) => &m.sensor_key,
            Mapping::Strum(m) => &m.axis_prefix,
        }
    }
}

/// Action name → mapping. Immutable once published; replaced whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSet {
    entries: BTreeMap<Action, Mapping>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, action: Action) -> Option<&Mapping> {
        self.entries.get(&action)
    }

    pub fn finger(&self, action: Action) -> Option<&FingerMapping> {
        match self.entries.get(&action) {
            Some(Mapping::Finger(m)) => Some(m),
            _ => None,
        }
    }

    pub fn strum(&self, action: Action) -> Option<&StrumMapping> {
        match self.entries.get(&action) {
            Some(Mapping::Strum(m)) => Some(m),
            _ => None,
        }
    }

    /// Validated insert.
    pub fn insert(&mut self, action: Action, mapping: Mapping) -> Result<(), MappingError> {
        mapping.validate(action)?;
        self.entries.insert(action, mapping);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Action, &Mapping)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a mapping document. A document that is not a JSON object is an
    /// error; individual bad entries are returned as rejections and skipped.
    pub fn parse(json: &str) -> Result<(Self, Vec<MappingError>), MappingError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut set = MappingSet::new();
        let mut rejected = Vec::new();

        for (name, value) in raw {
            let action = match name.parse::<Action>() {
                Ok(a) => a,
                Err(_) => {
                    rejected.push(MappingError::UnknownAction(name));
                    continue;
                }
            };
            let mapping = match serde_json::from_value::<Mapping>(value) {
                Ok(m) => m,
                Err(source) => {
                    rejected.push(MappingError::Malformed {
                        action: name,
                        source,
                    });
                    continue;
                }
            };
            if let Err(e) = set.insert(action, mapping) {
                rejected.push(e);
            }
        }
        Ok((set, rejected))
    }

    pub fn to_json(&self) -> Result<String, MappingError> {
        let named: BTreeMap<String, &Mapping> = self
            .entries
            .iter()
            .map(|(a, m)| (a.name(), m))
            .collect();
        Ok(serde_json::to_string_pretty(&named)?)
    }

    /// Load from a JSON file. A missing or corrupt file gives an empty set.
    pub fn load(path: &Path) -> Self {
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No mapping file at {:?}; starting uncalibrated", path);
                return Self::new();
            }
            Err(e) => {
                warn!("Failed to read mapping file {:?}: {}", path, e);
                return Self::new();
            }
        };
        match Self::parse(&data) {
            Ok((set, rejected)) => {
                for e in &rejected {
                    warn!("Ignoring mapping entry in {:?}: {}", path, e);
                }
                info!("Loaded {} mappings from {:?}", set.len(), path);
                set
            }
            Err(e) => {
                warn!("Failed to parse mapping file {:?}: {}", path, e);
                Self::new()
            }
        }
    }

    /// Write the whole set. Goes through a temp file so a crash mid-write
    /// never leaves a truncated document behind.
    pub fn save(&self, path: &Path) -> Result<(), MappingError> {
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        info!("Mappings saved to {:?}", path);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, atomically-replaced mapping set with optional persistence.
///
/// Readers take the current `Arc` once per tick and never block on I/O;
/// installers serialize on a separate lock while they persist.
#[derive(Clone)]
pub struct MappingStore {
    current: Arc<Mutex<Arc<MappingSet>>>,
    install: Arc<Mutex<()>>,
    path: Option<PathBuf>,
}

impl MappingStore {
    pub fn in_memory(set: MappingSet) -> Self {
        Self {
            current: Arc::new(Mutex::new(Arc::new(set))),
            install: Arc::new(Mutex::new(())),
            path: None,
        }
    }

    /// Load `path` (missing/corrupt → empty) and persist back to it on install.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let set = MappingSet::load(&path);
        Self {
            path: Some(path),
            ..Self::in_memory(set)
        }
    }

    pub fn current(&self) -> Arc<MappingSet> {
        Arc::clone(&lock(&self.current))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace one action's entry and persist the whole set. On any error
    /// the previously published set stays in effect.
    pub fn install(&self, action: Action, mapping: Mapping) -> Result<(), MappingError> {
        let _writer = lock(&self.install);
        let mut next = (*self.current()).clone();
        next.insert(action, mapping)?;
        if let Some(path) = &self.path {
            next.save(path)?;
        }
        *lock(&self.current) = Arc::new(next);
        info!("Installed mapping for {}", action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FingerId, Hand};

    fn finger(i: usize) -> Action {
        Action::Finger(FingerId::new(i).unwrap())
    }

    fn finger_mapping(key: &str, rest: f64, full: f64) -> Mapping {
        Mapping::Finger(FingerMapping {
            sensor_key: key.into(),
            rest_value: rest,
            half: (rest + full) / 2.0,
            full_value: full,
            crosstalk_reference: BTreeMap::from([("adc_v33".to_string(), 3900.0)]),
        })
    }

    fn strum_mapping(gx: f64) -> Mapping {
        Mapping::Strum(StrumMapping {
            axis_prefix: "gyro_".into(),
            reference: Vec3::new(gx, 0.0, 0.0),
            threshold: gx.abs() * 0.4,
        })
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("glove_mapping_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_file_format_shape() {
        let mut set = MappingSet::new();
        set.insert(finger(0), finger_mapping("adc_v32", 4095.0, 500.0)).unwrap();
        set.insert(Action::Strum(Hand::Master), strum_mapping(20000.0)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&set.to_json().unwrap()).unwrap();
        assert_eq!(v["finger1"]["key"], "adc_v32");
        assert_eq!(v["finger1"]["rest"], 4095.0);
        assert_eq!(v["finger1"]["half"], 2297.5);
        assert_eq!(v["finger1"]["crosstalk_ref"]["adc_v33"], 3900.0);
        assert_eq!(v["strum_master"]["key_prefix"], "gyro_");
        assert_eq!(v["strum_master"]["vector"]["gx"], 20000.0);
        assert_eq!(v["strum_master"]["threshold"], 8000.0);
    }

    #[test]
    fn test_parse_roundtrip() {
        let mut set = MappingSet::new();
        set.insert(finger(2), finger_mapping("adc_v34", 4000.0, 900.0)).unwrap();
        set.insert(Action::Strum(Hand::Slave), strum_mapping(-15000.0)).unwrap();
        let (loaded, rejected) = MappingSet::parse(&set.to_json().unwrap()).unwrap();
        assert!(rejected.is_empty());
        assert_eq!(loaded, set);
    }

    #[test]
    fn test_parse_rejects_bad_entries_keeps_good() {
        let json = r#"{
            "finger1": {"key":"adc_v32","rest":4095,"half":2000,"full":500,"crosstalk_ref":{}},
            "finger2": {"key":"adc_v33","rest":3000,"half":3000,"full":3000,"crosstalk_ref":{}},
            "finger3": {"key":"adc_v34","rest":4095,"full":500,"crosstalk_ref":{}},
            "finger4": {"key":"adc_v35","rest":4095,"half":1,"full":500,"crosstalk_ref":{},"x":1},
            "strum_master": {"key_prefix":"gyro_","vector":{"gx":0,"gy":0,"gz":0},"threshold":1},
            "strum_slave": {"key":"adc_v32","rest":1,"half":2,"full":3,"crosstalk_ref":{}},
            "Dedo 1": {"key":"adc_v32","rest":1,"half":2,"full":3,"crosstalk_ref":{}}
        }"#;
        let (set, rejected) = MappingSet::parse(json).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.finger(finger(0)).is_some());
        assert_eq!(rejected.len(), 6);
        assert!(rejected.iter().any(|e| matches!(e, MappingError::DegenerateRange { .. })));
        assert!(rejected.iter().any(|e| matches!(e, MappingError::ZeroVector { .. })));
        assert!(rejected.iter().any(|e| matches!(e, MappingError::KindMismatch { .. })));
        assert!(rejected.iter().any(|e| matches!(e, MappingError::UnknownAction(_))));
        let malformed = rejected
            .iter()
            .filter(|e| matches!(e, MappingError::Malformed { .. }))
            .count();
        assert_eq!(malformed, 2, "missing half and unknown field");
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let missing = temp_path("missing");
        let _ = fs::remove_file(&missing);
        assert!(MappingSet::load(&missing).is_empty());

        let corrupt = temp_path("corrupt");
        fs::write(&corrupt, "{ not json").unwrap();
        assert!(MappingSet::load(&corrupt).is_empty());
        let _ = fs::remove_file(&corrupt);
    }

    #[test]
    fn test_store_install_persists_and_publishes() {
        let path = temp_path("store");
        let _ = fs::remove_file(&path);
        let store = MappingStore::open(&path);
        assert!(store.current().is_empty());

        let before = store.current();
        store
            .install(finger(1), finger_mapping("adc_v33", 4095.0, 600.0))
            .unwrap();
        assert!(before.is_empty(), "old snapshot of the set is unchanged");
        assert_eq!(store.current().len(), 1);

        let reopened = MappingStore::open(&path);
        assert_eq!(*reopened.current(), *store.current());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_store_rejects_invalid_keeps_previous() {
        let store = MappingStore::in_memory(MappingSet::new());
        store
            .install(finger(0), finger_mapping("adc_v32", 4095.0, 500.0))
            .unwrap();
        let err = store
            .install(finger(0), finger_mapping("adc_v33", 2000.0, 2000.0))
            .unwrap_err();
        assert!(matches!(err, MappingError::DegenerateRange { .. }));
        assert_eq!(store.current().finger(finger(0)).unwrap().sensor_key, "adc_v32");
    }

    #[test]
    fn test_store_persist_failure_keeps_previous() {
        let dir = std::env::temp_dir().join(format!("glove_no_such_dir_{}", std::process::id()));
        let store = MappingStore {
            path: Some(dir.join("nested").join("m.json")),
            ..MappingStore::in_memory(MappingSet::new())
        };
        let err = store
            .install(finger(0), finger_mapping("adc_v32", 4095.0, 500.0))
            .unwrap_err();
        assert!(matches!(err, MappingError::Io(_)), "got {}", err);
        assert!(store.current().is_empty());
    }
}

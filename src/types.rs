use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

// ─── Sensor snapshot ────────────────────────────────────────────────────────

/// One consistent, fully-decoded set of named sensor readings.
///
/// Keys are namespaced by source: `gyro_*` (master IMU), `slave_*` (slave IMU),
/// `mag_*` (magnetometer), `adc_v*` (flex channels). A `BTreeMap` keeps
/// enumeration order stable, so "first channel wins" tie-breaks are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Microseconds since session start, host clock
    pub captured_us: u64,
    pub values: BTreeMap<String, f64>,
}

impl Snapshot {
    pub fn new(captured_us: u64) -> Self {
        Self {
            captured_us,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Angular-velocity vector `{prefix}gx/gy/gz`. All three axes must be present.
    pub fn gyro(&self, prefix: &str) -> Option<Vec3> {
        Some(Vec3 {
            gx: self.get(&format!("{prefix}gx"))?,
            gy: self.get(&format!("{prefix}gy"))?,
            gz: self.get(&format!("{prefix}gz"))?,
        })
    }

    /// Flex channels (`adc_v*`) in key order.
    pub fn flex_channels(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter(|(k, _)| k.starts_with(FLEX_PREFIX))
            .map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={:>10}µs ", self.captured_us)?;
        for (k, v) in self.flex_channels() {
            write!(f, " {}={:.0}", k, v)?;
        }
        if let Some(g) = self.gyro(MASTER_PREFIX) {
            write!(f, "  M[{}]", g)?;
        }
        if let Some(g) = self.gyro(SLAVE_PREFIX) {
            write!(f, "  S[{}]", g)?;
        }
        Ok(())
    }
}

// ─── Vectors ────────────────────────────────────────────────────────────────

/// Angular velocity, raw IMU units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Vec3 {
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl Vec3 {
    pub const fn new(gx: f64, gy: f64, gz: f64) -> Self {
        Self { gx, gy, gz }
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.gx * other.gx + self.gy * other.gy + self.gz * other.gz
    }

    pub fn magnitude(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.gx.is_finite() && self.gy.is_finite() && self.gz.is_finite()
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0} {:.0} {:.0}", self.gx, self.gy, self.gz)
    }
}

// ─── Logical actions ────────────────────────────────────────────────────────

/// The two IMUs on the glove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hand {
    Master,
    Slave,
}

impl Hand {
    pub const ALL: [Hand; 2] = [Hand::Master, Hand::Slave];

    /// Snapshot key prefix for this hand's gyro axes.
    pub fn prefix(self) -> &'static str {
        match self {
            Hand::Master => MASTER_PREFIX,
            Hand::Slave => SLAVE_PREFIX,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Hand::Master => 0,
            Hand::Slave => 1,
        }
    }
}

impl fmt::Display for Hand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hand::Master => "master",
            Hand::Slave => "slave",
        })
    }
}

/// Finger slot 0..4, which is also its bit in the output vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerId(u8);

impl FingerId {
    pub const ALL: [FingerId; NUM_FINGERS] = [FingerId(0), FingerId(1), FingerId(2), FingerId(3)];

    pub fn new(index: usize) -> Option<Self> {
        (index < NUM_FINGERS).then_some(FingerId(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A calibratable logical action. Serialized names: `finger1`..`finger4`,
/// `strum_master`, `strum_slave`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Finger(FingerId),
    Strum(Hand),
}

impl Action {
    pub fn all() -> Vec<Action> {
        FingerId::ALL
            .iter()
            .map(|&f| Action::Finger(f))
            .chain(Hand::ALL.iter().map(|&h| Action::Strum(h)))
            .collect()
    }

    pub fn name(&self) -> String {
        match self {
            Action::Finger(f) => format!("finger{}", f.index() + 1),
            Action::Strum(h) => format!("strum_{}", h),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strum_master" => return Ok(Action::Strum(Hand::Master)),
            "strum_slave" => return Ok(Action::Strum(Hand::Slave)),
            _ => {}
        }
        s.strip_prefix("finger")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| n.checked_sub(1))
            .and_then(FingerId::new)
            .map(Action::Finger)
            .ok_or_else(|| format!("unknown action: {:?}", s))
    }
}

// ─── Detector output ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrumDirection {
    Up,
    Down,
}

impl fmt::Display for StrumDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrumDirection::Up => "UP",
            StrumDirection::Down => "DOWN",
        })
    }
}

/// One directional hit. Never a continuous state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrumEvent {
    pub hand: Hand,
    pub direction: StrumDirection,
    /// Signed projection onto the calibrated reference, same units as the reference
    pub projection: f64,
}

/// Finger bits in emulator order: Green, Red, Yellow, Blue.
pub type FingerStates = [bool; NUM_FINGERS];

/// Combined result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstrumentState {
    pub fingers: FingerStates,
    pub strums: Vec<StrumEvent>,
}

impl fmt::Display for InstrumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = self
            .fingers
            .iter()
            .map(|&b| if b { '1' } else { '0' })
            .collect();
        write!(f, "fingers=[{}]", bits)?;
        for s in &self.strums {
            write!(f, " strum:{}:{}({:.0})", s.hand, s.direction, s.projection)?;
        }
        Ok(())
    }
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic clock for the capture session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

pub const NUM_FINGERS: usize = 4;

pub const FLEX_PREFIX: &str = "adc_v";
pub const MASTER_PREFIX: &str = "gyro_";
pub const SLAVE_PREFIX: &str = "slave_";

/// Flex channel keys in wire order.
pub const FLEX_KEYS: [&str; 4] = ["adc_v32", "adc_v33", "adc_v34", "adc_v35"];

pub const FINGER_COLORS: [&str; NUM_FINGERS] = ["Green", "Red", "Yellow", "Blue"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_roundtrip() {
        for action in Action::all() {
            let parsed: Action = action.name().parse().unwrap();
            assert_eq!(parsed, action);
        }
        assert_eq!(Action::all().len(), 6);
    }

    #[test]
    fn test_action_parse_rejects_unknown() {
        assert!("finger0".parse::<Action>().is_err());
        assert!("finger5".parse::<Action>().is_err());
        assert!("strum_left".parse::<Action>().is_err());
        assert!("Dedo 1".parse::<Action>().is_err());
    }

    #[test]
    fn test_gyro_requires_all_axes() {
        let s = Snapshot::new(0)
            .with("gyro_gx", 1.0)
            .with("gyro_gy", 2.0)
            .with("gyro_gz", 3.0)
            .with("slave_gx", 1.0);
        assert_eq!(s.gyro("gyro_"), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(s.gyro("slave_"), None);
    }

    #[test]
    fn test_flex_channels_sorted() {
        let s = Snapshot::new(0)
            .with("adc_v35", 4.0)
            .with("gyro_gx", 0.0)
            .with("adc_v32", 1.0);
        let keys: Vec<&str> = s.flex_channels().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["adc_v32", "adc_v35"]);
    }

    #[test]
    fn test_vec3_magnitude() {
        assert!((Vec3::new(3.0, 4.0, 0.0).magnitude() - 5.0).abs() < 1e-12);
        assert_eq!(Vec3::default().magnitude(), 0.0);
    }
}

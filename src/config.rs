//! Engine tunables. Filled from the command line; defaults match a glove
//! with 12-bit flex ADCs and ±32k raw gyro units.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("smoothing alpha {0} must be in (0, 1]")]
    Alpha(f64),
    #[error("release threshold {release} must not exceed trigger threshold {trigger}")]
    Thresholds { trigger: f64, release: f64 },
    #[error("crosstalk gain {0} must be >= 0")]
    Gain(f64),
    #[error("strum threshold fraction {0} must be in (0, 1]")]
    StrumFraction(f64),
    #[error("noise floor {0} must be > 0")]
    NoiseFloor(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FingerConfig {
    /// EMA weight of the newest raw sample
    pub alpha: f64,
    /// Clean activation above this arms the finger
    pub trigger_threshold: f64,
    /// Clean activation below this disarms it
    pub release_threshold: f64,
    pub crosstalk_gain: f64,
    /// Other fingers below this activation contribute no crosstalk
    pub crosstalk_epsilon: f64,
}

impl Default for FingerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.35,
            trigger_threshold: 0.5,
            release_threshold: 0.35,
            crosstalk_gain: 1.0,
            crosstalk_epsilon: 0.05,
        }
    }
}

impl FingerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(ConfigError::Alpha(self.alpha));
        }
        if self.release_threshold > self.trigger_threshold {
            return Err(ConfigError::Thresholds {
                trigger: self.trigger_threshold,
                release: self.release_threshold,
            });
        }
        if !(self.crosstalk_gain >= 0.0) {
            return Err(ConfigError::Gain(self.crosstalk_gain));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrumConfig {
    /// Minimum time between two events from the same hand
    pub cooldown: Duration,
}

impl Default for StrumConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Smallest rest→full swing (raw units) accepted for a flex channel
    pub noise_floor: f64,
    /// Strum threshold as a fraction of the peak vector's magnitude
    pub strum_threshold_fraction: f64,
    /// How long the interactive strum recording window stays open
    pub record_window: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            noise_floor: 100.0,
            strum_threshold_fraction: 0.4,
            record_window: Duration::from_secs(3),
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.noise_floor > 0.0) {
            return Err(ConfigError::NoiseFloor(self.noise_floor));
        }
        let k = self.strum_threshold_fraction;
        if !(k > 0.0 && k <= 1.0) {
            return Err(ConfigError::StrumFraction(k));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub finger: FingerConfig,
    pub strum: StrumConfig,
    pub calibration: CalibrationConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.finger.validate()?;
        self.calibration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_single_threshold_allowed() {
        let cfg = FingerConfig {
            release_threshold: 0.5,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_alpha = FingerConfig {
            alpha: 0.0,
            ..Default::default()
        };
        assert_eq!(bad_alpha.validate(), Err(ConfigError::Alpha(0.0)));

        let inverted = FingerConfig {
            trigger_threshold: 0.3,
            release_threshold: 0.6,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(ConfigError::Thresholds { .. })));

        let k = CalibrationConfig {
            strum_threshold_fraction: 1.5,
            ..Default::default()
        };
        assert_eq!(k.validate(), Err(ConfigError::StrumFraction(1.5)));
    }
}

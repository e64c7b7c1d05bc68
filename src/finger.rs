use crate::config::FingerConfig;
use crate::dsp::{ema, normalize};
use crate::mapping::{FingerMapping, MappingSet};
use crate::types::{Action, FingerId, FingerStates, Snapshot, NUM_FINGERS};
use log::{debug, trace};

/// Per-finger press/release detector for the flex channels.
///
/// # Pipeline, per tick
///
///   1. EMA-smooth the raw reading of the finger's mapped channel.
///   2. Normalise against the calibrated rest/full endpoints → raw activation.
///   3. Subtract crosstalk: every other finger that is bent leaks onto this
///      finger's sensor by the amount its calibration snapshot recorded,
///      scaled by how far that other finger is bent.
///   4. Hysteresis: arm above `trigger_threshold`, disarm below
///      `release_threshold`.
///
/// Step 3 runs pairwise over all fingers every tick using the *raw*
/// activations of the others, so cancellation does not depend on finger order.
pub struct FingerEngine {
    config: FingerConfig,
    state: [FingerRuntimeState; NUM_FINGERS],
    last_output: FingerStates,
}

#[derive(Debug, Clone, Default)]
struct FingerRuntimeState {
    /// Channel the smoothed value belongs to; a remap re-seeds the filter
    key: Option<String>,
    smoothed: Option<f64>,
    armed: bool,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerUpdate {
    pub states: FingerStates,
    /// True when `states` differs from the previous tick
    pub changed: bool,
    /// Post-crosstalk activation, `None` where the finger was skipped
    pub activations: [Option<f64>; NUM_FINGERS],
}

impl FingerEngine {
    pub fn new(config: FingerConfig) -> Self {
        Self {
            config,
            state: Default::default(),
            last_output: [false; NUM_FINGERS],
        }
    }

    pub fn config(&self) -> &FingerConfig {
        &self.config
    }

    pub fn process(&mut self, snapshot: &Snapshot, mappings: &MappingSet) -> FingerUpdate {
        let mut mapped: [Option<&FingerMapping>; NUM_FINGERS] = [None; NUM_FINGERS];
        let mut raw_activation = [None; NUM_FINGERS];

        for finger in FingerId::ALL {
            let i = finger.index();
            let st = &mut self.state[i];

            let Some(m) = mappings.finger(Action::Finger(finger)) else {
                *st = FingerRuntimeState::default();
                continue;
            };
            // A gap in the channel disarms: the finger must cross the
            // trigger again once readings resume.
            let Some(raw) = snapshot.get(&m.sensor_key) else {
                trace!("finger{}: channel {} missing from snapshot", i + 1, m.sensor_key);
                st.armed = false;
                continue;
            };
            if !raw.is_finite() {
                trace!("finger{}: non-finite reading {} on {}", i + 1, raw, m.sensor_key);
                st.armed = false;
                continue;
            }
            if m.range() == 0.0 {
                continue;
            }

            if st.key.as_deref() != Some(m.sensor_key.as_str()) {
                debug!("finger{}: filter seeded on {}", i + 1, m.sensor_key);
                st.key = Some(m.sensor_key.clone());
                st.smoothed = None;
            }
            let smoothed = match st.smoothed {
                Some(prev) => ema(prev, raw, self.config.alpha),
                None => raw,
            };
            st.smoothed = Some(smoothed);

            mapped[i] = Some(m);
            raw_activation[i] = Some(normalize(smoothed, m.rest_value, m.full_value));
        }

        let mut states = [false; NUM_FINGERS];
        let mut activations = [None; NUM_FINGERS];

        for i in 0..NUM_FINGERS {
            let (Some(m), Some(own)) = (mapped[i], raw_activation[i]) else {
                continue;
            };

            let leak = self.crosstalk_onto(i, m, &mapped, &raw_activation);
            let clean = (own - leak).clamp(0.0, 1.0);
            activations[i] = Some(clean);

            let st = &mut self.state[i];
            if !st.armed && clean > self.config.trigger_threshold {
                st.armed = true;
                debug!("finger{} pressed (activation {:.2}, leak {:.2})", i + 1, clean, leak);
            } else if st.armed && clean < self.config.release_threshold {
                st.armed = false;
                debug!("finger{} released (activation {:.2})", i + 1, clean);
            }
            states[i] = st.armed;
        }

        let changed = states != self.last_output;
        self.last_output = states;
        FingerUpdate {
            states,
            changed,
            activations,
        }
    }

    /// Activation that the other bent fingers push onto finger `i`'s sensor.
    fn crosstalk_onto(
        &self,
        i: usize,
        own: &FingerMapping,
        mapped: &[Option<&FingerMapping>; NUM_FINGERS],
        raw_activation: &[Option<f64>; NUM_FINGERS],
    ) -> f64 {
        let mut leak = 0.0;
        for j in (0..NUM_FINGERS).filter(|&j| j != i) {
            let (Some(other), Some(a_j)) = (mapped[j], raw_activation[j]) else {
                continue;
            };
            if !a_j.is_finite() || a_j <= self.config.crosstalk_epsilon {
                continue;
            }
            let Some(&observed) = other.crosstalk_reference.get(&own.sensor_key) else {
                continue;
            };
            let coupling = normalize(observed, own.rest_value, own.full_value);
            leak += a_j * coupling * self.config.crosstalk_gain;
        }
        leak
    }
}

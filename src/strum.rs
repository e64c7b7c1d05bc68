use crate::config::StrumConfig;
use crate::dsp::project;
use crate::mapping::MappingSet;
use crate::types::{Action, Hand, Snapshot, StrumDirection, StrumEvent};
use log::{debug, trace};
use std::time::Instant;

/// Directional strum detector.
///
/// The live angular velocity is projected onto the calibrated reference
/// vector. A projection whose magnitude clears the threshold is a hit; its
/// sign relative to the calibration swing gives the direction (same sign as
/// the calibration = down). Each hand has its own cooldown, and every hit
/// that clears it is exactly one event.
pub struct StrumEngine {
    config: StrumConfig,
    last_trigger: [Option<Instant>; 2],
}

impl StrumEngine {
    pub fn new(config: StrumConfig) -> Self {
        Self {
            config,
            last_trigger: [None; 2],
        }
    }

    pub fn process(&mut self, snapshot: &Snapshot, mappings: &MappingSet) -> Vec<StrumEvent> {
        self.process_at(Instant::now(), snapshot, mappings)
    }

    /// As `process`, with an explicit tick time.
    pub fn process_at(
        &mut self,
        now: Instant,
        snapshot: &Snapshot,
        mappings: &MappingSet,
    ) -> Vec<StrumEvent> {
        let mut events = Vec::new();

        for hand in Hand::ALL {
            let Some(m) = mappings.strum(Action::Strum(hand)) else {
                continue;
            };
            let Some(live) = snapshot.gyro(&m.axis_prefix) else {
                trace!("strum {}: axes {}g* missing", hand, m.axis_prefix);
                continue;
            };
            let Some(projection) = project(&live, &m.reference) else {
                continue;
            };
            if projection.abs() <= m.threshold {
                continue;
            }

            let slot = &mut self.last_trigger[hand.index()];
            if let Some(last) = *slot {
                if now.saturating_duration_since(last) < self.config.cooldown {
                    trace!("strum {}: in cooldown ({:.0})", hand, projection);
                    continue;
                }
            }
            *slot = Some(now);

            let direction = if projection > 0.0 {
                StrumDirection::Down
            } else {
                StrumDirection::Up
            };
            debug!(
                "strum {} {} (projection {:.0}, threshold {:.0})",
                hand, direction, projection, m.threshold
            );
            events.push(StrumEvent {
                hand,
                direction,
                projection,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Mapping, StrumMapping};
    use crate::types::Vec3;
    use std::time::Duration;

    fn set_with(hand: Hand, reference: Vec3) -> MappingSet {
        let mut set = MappingSet::new();
        set.insert(
            Action::Strum(hand),
            Mapping::Strum(StrumMapping {
                axis_prefix: hand.prefix().into(),
                reference,
                threshold: reference.magnitude() * 0.4,
            }),
        )
        .unwrap();
        set
    }

    fn gyro(prefix: &str, v: Vec3) -> Snapshot {
        Snapshot::new(0)
            .with(&format!("{prefix}gx"), v.gx)
            .with(&format!("{prefix}gy"), v.gy)
            .with(&format!("{prefix}gz"), v.gz)
    }

    #[test]
    fn test_down_then_cooldown() {
        let set = set_with(Hand::Master, Vec3::new(20000.0, 0.0, 0.0));
        let mut eng = StrumEngine::new(StrumConfig::default());
        let t0 = Instant::now();
        let live = gyro("gyro_", Vec3::new(21000.0, 0.0, 0.0));

        let first = eng.process_at(t0, &live, &set);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].direction, StrumDirection::Down);
        assert_eq!(first[0].hand, Hand::Master);
        assert!((first[0].projection - 21000.0).abs() < 1e-9);

        let again = eng.process_at(t0 + Duration::from_millis(50), &live, &set);
        assert!(again.is_empty(), "inside cooldown");
        let later = eng.process_at(t0 + Duration::from_millis(130), &live, &set);
        assert_eq!(later.len(), 1, "cooldown elapsed");
    }

    #[test]
    fn test_opposite_swing_is_up() {
        let set = set_with(Hand::Master, Vec3::new(12000.0, 9000.0, 0.0));
        let mut eng = StrumEngine::new(StrumConfig::default());
        let events = eng.process_at(
            Instant::now(),
            &gyro("gyro_", Vec3::new(-12000.0, -9000.0, 0.0)),
            &set,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, StrumDirection::Up);
        assert!((events[0].projection + 15000.0).abs() < 1e-9);
    }

    #[test]
    fn test_off_axis_motion_ignored() {
        // Large, but perpendicular to the calibrated swing
        let set = set_with(Hand::Master, Vec3::new(20000.0, 0.0, 0.0));
        let mut eng = StrumEngine::new(StrumConfig::default());
        let events = eng.process_at(
            Instant::now(),
            &gyro("gyro_", Vec3::new(1000.0, 30000.0, -30000.0)),
            &set,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_below_threshold_ignored() {
        let set = set_with(Hand::Master, Vec3::new(20000.0, 0.0, 0.0));
        let mut eng = StrumEngine::new(StrumConfig::default());
        let t0 = Instant::now();
        assert!(eng
            .process_at(t0, &gyro("gyro_", Vec3::new(7999.0, 0.0, 0.0)), &set)
            .is_empty());
        // A sub-threshold tick does not start the cooldown
        assert_eq!(
            eng.process_at(
                t0 + Duration::from_millis(1),
                &gyro("gyro_", Vec3::new(9000.0, 0.0, 0.0)),
                &set
            )
            .len(),
            1
        );
    }

    #[test]
    fn test_hands_have_independent_cooldowns() {
        let mut set = set_with(Hand::Master, Vec3::new(20000.0, 0.0, 0.0));
        set.insert(
            Action::Strum(Hand::Slave),
            Mapping::Strum(StrumMapping {
                axis_prefix: "slave_".into(),
                reference: Vec3::new(0.0, 0.0, -10000.0),
                threshold: 4000.0,
            }),
        )
        .unwrap();
        let mut eng = StrumEngine::new(StrumConfig::default());
        let t0 = Instant::now();

        let master = gyro("gyro_", Vec3::new(20000.0, 0.0, 0.0));
        assert_eq!(eng.process_at(t0, &master, &set).len(), 1);

        let mut both = master.clone();
        for (k, v) in gyro("slave_", Vec3::new(0.0, 0.0, 8000.0)).values {
            both.values.insert(k, v);
        }
        let events = eng.process_at(t0 + Duration::from_millis(10), &both, &set);
        assert_eq!(events.len(), 1, "master still cooling down");
        assert_eq!(events[0].hand, Hand::Slave);
        assert_eq!(events[0].direction, StrumDirection::Up);
    }

    #[test]
    fn test_missing_mapping_or_axes() {
        let mut eng = StrumEngine::new(StrumConfig::default());
        let live = gyro("gyro_", Vec3::new(30000.0, 0.0, 0.0));
        assert!(eng.process(&live, &MappingSet::new()).is_empty());

        let set = set_with(Hand::Slave, Vec3::new(20000.0, 0.0, 0.0));
        assert!(eng.process(&live, &set).is_empty(), "slave axes absent");
    }
}

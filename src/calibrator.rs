//! Guided calibration: derives a finger or strum mapping from a few captured
//! snapshots and installs it into the shared store.
//!
//! Finger protocol: capture at rest, half bent, fully bent. The flex channel
//! that moved most between rest and full becomes the finger's sensor, and the
//! other channels at full bend become its crosstalk reference.
//!
//! Strum protocol: capture at rest, arm, then record one or more down-strums
//! while every incoming snapshot is fed to `observe`; the snapshot whose gyro
//! magnitude strays furthest from rest becomes the reference vector.

use crate::config::CalibrationConfig;
use crate::mapping::{FingerMapping, Mapping, MappingError, MappingStore, StrumMapping};
use crate::telemetry::TelemetryReader;
use crate::types::{Action, Hand, Snapshot, Vec3};
use log::{info, warn};
use std::io::{self, Write};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Rest,
    Half,
    Full,
    Arm,
    Record,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// Step accepted; this is the next one.
    Next(Step),
    /// Mapping derived, installed and persisted.
    Done(Mapping),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration already in progress for {0}")]
    Busy(Action),
    #[error("no calibration in progress")]
    NotActive,
    #[error("step {got:?} not valid now, expected {expected:?}")]
    WrongStep { expected: Step, got: Step },
    #[error("glove disconnected mid-capture")]
    Disconnected,
    #[error("no flex channel moved enough: best {key} changed {delta:.0} (< {floor:.0})")]
    NoVariance { key: String, delta: f64, floor: f64 },
    #[error("snapshot has no flex channels")]
    NoFlexChannels,
    #[error("channel {0} missing from snapshot")]
    MissingChannel(String),
    #[error("no swing recorded (peak deviation {deviation:.0})")]
    EmptyPeak { deviation: f64 },
    #[error("peak vector has zero magnitude")]
    DegenerateVector,
    #[error("could not install mapping: {0}")]
    Persist(#[from] MappingError),
}

enum Session {
    Finger {
        action: Action,
        step: Step,
        rest: Option<Snapshot>,
        half: Option<Snapshot>,
    },
    Strum {
        action: Action,
        hand: Hand,
        step: Step,
        baseline: Vec3,
        peak: Option<Vec3>,
        peak_deviation: f64,
    },
}

impl Session {
    fn action(&self) -> Action {
        match self {
            Session::Finger { action, .. } | Session::Strum { action, .. } => *action,
        }
    }

    fn step(&self) -> Step {
        match self {
            Session::Finger { step, .. } | Session::Strum { step, .. } => *step,
        }
    }
}

/// One-action-at-a-time calibration state machine.
pub struct Calibrator {
    store: MappingStore,
    config: CalibrationConfig,
    session: Option<Session>,
}

impl Calibrator {
    pub fn new(store: MappingStore, config: CalibrationConfig) -> Self {
        Self {
            store,
            config,
            session: None,
        }
    }

    /// Start calibrating `action`. Fails while another session is open.
    pub fn begin(&mut self, action: Action) -> Result<Step, CalibrationError> {
        if let Some(s) = &self.session {
            return Err(CalibrationError::Busy(s.action()));
        }
        info!("Calibration started for {}", action);
        // Strum sessions learn their baseline at the Rest capture
        self.session = Some(match action {
            Action::Finger(_) => Session::Finger {
                action,
                step: Step::Rest,
                rest: None,
                half: None,
            },
            Action::Strum(hand) => Session::Strum {
                action,
                hand,
                step: Step::Rest,
                baseline: Vec3::default(),
                peak: None,
                peak_deviation: -1.0,
            },
        });
        Ok(Step::Rest)
    }

    pub fn active(&self) -> Option<(Action, Step)> {
        self.session.as_ref().map(|s| (s.action(), s.step()))
    }

    pub fn cancel(&mut self) {
        if let Some(s) = self.session.take() {
            info!("Calibration for {} cancelled", s.action());
        }
    }

    /// Perform the expected step with the current snapshot. `None` means the
    /// glove is disconnected. Any error other than a step mismatch ends the
    /// session and leaves the installed mapping untouched.
    pub fn capture(&mut self, snapshot: Option<&Snapshot>) -> Result<Progress, CalibrationError> {
        let session = self.session.take().ok_or(CalibrationError::NotActive)?;
        match self.advance(session, snapshot) {
            Ok((Some(next), progress)) => {
                self.session = Some(next);
                Ok(progress)
            }
            Ok((None, progress)) => Ok(progress),
            Err((Some(kept), e)) => {
                self.session = Some(kept);
                Err(e)
            }
            Err((None, e)) => {
                warn!("Calibration failed: {}", e);
                Err(e)
            }
        }
    }

    /// Like `capture`, but checks the caller is on the step it thinks it is.
    pub fn capture_step(
        &mut self,
        step: Step,
        snapshot: Option<&Snapshot>,
    ) -> Result<Progress, CalibrationError> {
        let expected = self.active().ok_or(CalibrationError::NotActive)?.1;
        if expected != step {
            return Err(CalibrationError::WrongStep {
                expected,
                got: step,
            });
        }
        self.capture(snapshot)
    }

    /// Start the strum recording window.
    pub fn arm(&mut self) -> Result<Progress, CalibrationError> {
        self.capture_step(Step::Arm, None)
    }

    /// Close the strum recording window and derive the mapping.
    pub fn stop(&mut self) -> Result<Progress, CalibrationError> {
        self.capture_step(Step::Record, None)
    }

    /// Feed a live snapshot while a strum is recording. Returns true when it
    /// became the new peak.
    pub fn observe(&mut self, snapshot: &Snapshot) -> bool {
        let Some(Session::Strum {
            hand,
            step: Step::Record,
            baseline,
            peak,
            peak_deviation,
            ..
        }) = &mut self.session
        else {
            return false;
        };
        let Some(live) = snapshot.gyro(hand.prefix()) else {
            return false;
        };
        let deviation = (live.magnitude() - baseline.magnitude()).abs();
        if deviation > *peak_deviation {
            *peak_deviation = deviation;
            *peak = Some(live);
            return true;
        }
        false
    }

    #[allow(clippy::type_complexity)]
    fn advance(
        &self,
        session: Session,
        snapshot: Option<&Snapshot>,
    ) -> Result<(Option<Session>, Progress), (Option<Session>, CalibrationError)> {
        let step = session.step();
        // Arming and stopping a recording need no fresh snapshot
        let snap = match (step, snapshot) {
            (Step::Arm | Step::Record, _) => None,
            (_, Some(s)) => Some(s),
            (_, None) => return Err((None, CalibrationError::Disconnected)),
        };

        match session {
            Session::Finger {
                action,
                step,
                rest,
                half,
            } => {
                let snap = snap.cloned().unwrap_or_default();
                match step {
                    Step::Rest => Ok((
                        Some(Session::Finger {
                            action,
                            step: Step::Half,
                            rest: Some(snap),
                            half,
                        }),
                        Progress::Next(Step::Half),
                    )),
                    Step::Half => Ok((
                        Some(Session::Finger {
                            action,
                            step: Step::Full,
                            rest,
                            half: Some(snap),
                        }),
                        Progress::Next(Step::Full),
                    )),
                    _ => {
                        let (Some(rest), Some(half)) = (rest, half) else {
                            return Err((None, CalibrationError::NotActive));
                        };
                        let mapping = derive_finger(&rest, &half, &snap, self.config.noise_floor)
                            .map_err(|e| (None, e))?;
                        self.install(action, Mapping::Finger(mapping))
                    }
                }
            }
            Session::Strum {
                action,
                hand,
                step,
                baseline,
                peak,
                peak_deviation,
            } => match step {
                Step::Rest => {
                    let snap = snap.cloned().unwrap_or_default();
                    let Some(baseline) = snap.gyro(hand.prefix()) else {
                        let key = format!("{}gx", hand.prefix());
                        return Err((None, CalibrationError::MissingChannel(key)));
                    };
                    Ok((
                        Some(Session::Strum {
                            action,
                            hand,
                            step: Step::Arm,
                            baseline,
                            peak: None,
                            peak_deviation: -1.0,
                        }),
                        Progress::Next(Step::Arm),
                    ))
                }
                Step::Arm => {
                    info!("Recording {} strum peak...", hand);
                    Ok((
                        Some(Session::Strum {
                            action,
                            hand,
                            step: Step::Record,
                            baseline,
                            peak: None,
                            peak_deviation: -1.0,
                        }),
                        Progress::Next(Step::Record),
                    ))
                }
                _ => {
                    let mapping = derive_strum(
                        hand,
                        peak,
                        peak_deviation,
                        self.config.noise_floor,
                        self.config.strum_threshold_fraction,
                    )
                    .map_err(|e| (None, e))?;
                    self.install(action, Mapping::Strum(mapping))
                }
            },
        }
    }

    #[allow(clippy::type_complexity)]
    fn install(
        &self,
        action: Action,
        mapping: Mapping,
    ) -> Result<(Option<Session>, Progress), (Option<Session>, CalibrationError)> {
        self.store
            .install(action, mapping.clone())
            .map_err(|e| (None, CalibrationError::from(e)))?;
        info!("Calibration for {} complete: {}", action, mapping.source_key());
        Ok((None, Progress::Done(mapping)))
    }
}

/// Pick the flex channel with the largest rest→full swing (first wins ties).
fn derive_finger(
    rest: &Snapshot,
    half: &Snapshot,
    full: &Snapshot,
    noise_floor: f64,
) -> Result<FingerMapping, CalibrationError> {
    let mut best: Option<(&str, f64, f64, f64)> = None;
    for (key, rest_v) in rest.flex_channels() {
        let Some(full_v) = full.get(key) else {
            continue;
        };
        let delta = (rest_v - full_v).abs();
        if best.map_or(true, |(_, _, _, d)| delta > d) {
            best = Some((key, rest_v, full_v, delta));
        }
    }

    let (key, rest_v, full_v, delta) = best.ok_or(CalibrationError::NoFlexChannels)?;
    if delta < noise_floor {
        return Err(CalibrationError::NoVariance {
            key: key.to_string(),
            delta,
            floor: noise_floor,
        });
    }
    let half_v = half
        .get(key)
        .ok_or_else(|| CalibrationError::MissingChannel(key.to_string()))?;

    let crosstalk_reference = full
        .flex_channels()
        .filter(|(k, _)| *k != key)
        .map(|(k, v)| (k.to_string(), v))
        .collect();

    info!("Selected {} (rest {:.0} → full {:.0}, Δ{:.0})", key, rest_v, full_v, delta);
    Ok(FingerMapping {
        sensor_key: key.to_string(),
        rest_value: rest_v,
        half: half_v,
        full_value: full_v,
        crosstalk_reference,
    })
}

fn derive_strum(
    hand: Hand,
    peak: Option<Vec3>,
    peak_deviation: f64,
    noise_floor: f64,
    fraction: f64,
) -> Result<StrumMapping, CalibrationError> {
    let peak = match peak {
        Some(p) if peak_deviation >= noise_floor => p,
        _ => {
            return Err(CalibrationError::EmptyPeak {
                deviation: peak_deviation.max(0.0),
            })
        }
    };
    let magnitude = peak.magnitude();
    if magnitude <= f64::EPSILON {
        return Err(CalibrationError::DegenerateVector);
    }
    info!("{} strum peak [{}] |{:.0}|", hand, peak, magnitude);
    Ok(StrumMapping {
        axis_prefix: hand.prefix().to_string(),
        reference: peak,
        threshold: magnitude * fraction,
    })
}

// ─── Terminal driver ─────────────────────────────────────────────────────────

fn wait_for_enter(prompt: &str) {
    print!("   {} (press Enter) ", prompt);
    let _ = io::stdout().flush();
    let mut line = String::new();
    io::stdin().read_line(&mut line).ok();
}

fn current(reader: &TelemetryReader) -> Option<std::sync::Arc<Snapshot>> {
    if reader.is_connected() {
        reader.latest_snapshot()
    } else {
        None
    }
}

/// Walk one action through the wizard on stdin/stdout.
pub fn run_interactive(
    reader: &TelemetryReader,
    store: MappingStore,
    config: CalibrationConfig,
    action: Action,
) -> Result<Mapping, CalibrationError> {
    let window = config.record_window;
    let mut cal = Calibrator::new(store, config);
    let mut step = cal.begin(action)?;

    println!("\n── Calibrating {} ──", action);
    loop {
        match step {
            Step::Rest => wait_for_enter("Hold still, relaxed (REST)"),
            Step::Half => wait_for_enter("Bend the finger HALF way"),
            Step::Full => wait_for_enter("Bend the finger FULLY"),
            Step::Arm => wait_for_enter("Get ready to strum DOWN"),
            Step::Record => {
                println!("\r   ► Strum down now! ({:.0}s)", window.as_secs_f64());
                record(&mut cal, reader, window)?;
            }
        }

        let snap = current(reader);
        match cal.capture(snap.as_deref())? {
            Progress::Next(next) => step = next,
            Progress::Done(mapping) => {
                println!("\n   ✓ {} → {}\n", action, mapping.source_key());
                return Ok(mapping);
            }
        }
    }
}

fn record(
    cal: &mut Calibrator,
    reader: &TelemetryReader,
    window: Duration,
) -> Result<(), CalibrationError> {
    let start = Instant::now();
    while start.elapsed() < window {
        if !reader.is_connected() {
            cal.cancel();
            return Err(CalibrationError::Disconnected);
        }
        if reader.wait_for_update(Duration::from_millis(100)) {
            if let Some(s) = reader.latest_snapshot() {
                cal.observe(&s);
            }
        }
    }
    Ok(())
}

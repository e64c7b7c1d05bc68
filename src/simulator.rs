use crate::packet::PacketBuilder;
use crate::types::{Hand, SessionClock, StrumDirection, NUM_FINGERS};
use log::{debug, info};
use std::f32::consts::PI;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Flex ADC reading of a straight finger.
pub const FLEX_REST: f32 = 4095.0;
/// Flex ADC reading of a fully bent finger.
pub const FLEX_FULL: f32 = 500.0;
/// Fraction of a finger's bend that leaks onto each neighbouring channel.
pub const CROSSTALK: f32 = 0.3;
/// Peak raw gyro value of a simulated strum.
pub const STRUM_PEAK: f32 = 20000.0;

/// Synthetic glove: plays a gesture script and sends binary telemetry
/// records over UDP, the way the firmware does.
pub struct Simulator {
    clock: SessionClock,
    socket: UdpSocket,
    target: String,
    rate_hz: u32,
    stop: Arc<AtomicBool>,
    sent: u64,
}

/// Hand pose the script evolves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimState {
    /// 0 = straight, 1 = fully bent
    pub bend: [f32; NUM_FINGERS],
    pub gyro: [f32; 3],
    pub slave_gyro: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub enum Gesture {
    Hold { ms: u32 },
    Press { finger: usize, ms: u32 },
    Release { finger: usize, ms: u32 },
    /// A half-sine angular-velocity pulse; master swings about X, slave about Z.
    Strum { hand: Hand, direction: StrumDirection, ms: u32 },
}

impl Simulator {
    pub fn new(target: impl Into<String>, rate_hz: u32, clock: SessionClock) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            clock,
            socket,
            target: target.into(),
            rate_hz: rate_hz.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            sent: 0,
        })
    }

    /// Flag that ends `run_forever` (and any script in progress) when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Play a script once. Returns early if stopped.
    pub fn run(&mut self, gestures: &[Gesture]) -> io::Result<()> {
        let mut state = SimState::default();
        let tick_us = 1_000_000 / self.rate_hz as u64;
        for gesture in gestures {
            if self.stopped() {
                break;
            }
            self.execute(gesture, &mut state, tick_us)?;
        }
        Ok(())
    }

    /// Loop the demo script until the stop flag is set.
    pub fn run_forever(&mut self) -> io::Result<()> {
        info!("Simulator sending to {} at {} Hz", self.target, self.rate_hz);
        let script = demo_sequence();
        while !self.stopped() {
            self.run(&script)?;
        }
        info!("Simulator stopped after {} packets", self.sent);
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn execute(&mut self, gesture: &Gesture, state: &mut SimState, tick_us: u64) -> io::Result<()> {
        let ticks = |ms: u32| ((ms as u64 * 1000) / tick_us).max(1);
        match *gesture {
            Gesture::Hold { ms } => {
                debug!("  hold {}ms", ms);
                for _ in 0..ticks(ms) {
                    self.emit_tick(state, tick_us)?;
                }
            }

            Gesture::Press { finger, ms } | Gesture::Release { finger, ms } => {
                let Some(from) = state.bend.get(finger).copied() else {
                    return Ok(());
                };
                let to = if matches!(gesture, Gesture::Press { .. }) { 1.0 } else { 0.0 };
                debug!("  finger {} {:.1} → {:.1} over {}ms", finger, from, to, ms);
                let n = ticks(ms);
                for i in 1..=n {
                    state.bend[finger] = lerp(from, to, smoothstep(i as f32 / n as f32));
                    self.emit_tick(state, tick_us)?;
                }
            }

            Gesture::Strum { hand, direction, ms } => {
                debug!("  strum {} {} over {}ms", hand, direction, ms);
                let sign = match direction {
                    StrumDirection::Down => 1.0,
                    StrumDirection::Up => -1.0,
                };
                let n = ticks(ms);
                for i in 0..=n {
                    let v = sign * STRUM_PEAK * (PI * i as f32 / n as f32).sin();
                    match hand {
                        Hand::Master => state.gyro = [v, 0.0, 0.0],
                        Hand::Slave => state.slave_gyro = [0.0, 0.0, v],
                    }
                    self.emit_tick(state, tick_us)?;
                }
                state.gyro = [0.0; 3];
                state.slave_gyro = [0.0; 3];
            }
        }
        Ok(())
    }

    fn emit_tick(&mut self, state: &SimState, tick_us: u64) -> io::Result<()> {
        let mut packet = frame(state);
        packet.timestamp = (self.clock.now_us() / 1000) as u32;
        self.socket.send_to(&packet.encode(), &self.target)?;
        self.sent += 1;
        thread::sleep(Duration::from_micros(tick_us));
        Ok(())
    }
}

/// Render a pose as a telemetry record, with neighbour crosstalk.
pub fn frame(state: &SimState) -> PacketBuilder {
    let span = FLEX_REST - FLEX_FULL;
    let mut flex = [FLEX_REST; NUM_FINGERS];
    for (i, value) in flex.iter_mut().enumerate() {
        let left = if i > 0 { state.bend[i - 1] } else { 0.0 };
        let right = state.bend.get(i + 1).copied().unwrap_or(0.0);
        let leak = CROSSTALK * (left + right);
        let bend = (state.bend[i] + leak).clamp(0.0, 1.0);
        *value = FLEX_REST - span * bend;
    }
    PacketBuilder {
        accel: [0, 0, 16384],
        gyro: state.gyro.map(to_raw),
        flex,
        slave_gyro: state.slave_gyro.map(to_raw),
        ..Default::default()
    }
}

fn to_raw(v: f32) -> i16 {
    v.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

// ─── Demo script ────────────────────────────────────────────────────────────

/// Single notes, a chord and a few strums on both hands; about six seconds.
pub fn demo_sequence() -> Vec<Gesture> {
    use Gesture::*;
    vec![
        Hold { ms: 500 },
        Press { finger: 0, ms: 150 },
        Strum { hand: Hand::Master, direction: StrumDirection::Down, ms: 80 },
        Hold { ms: 300 },
        Release { finger: 0, ms: 150 },
        Press { finger: 1, ms: 150 },
        Strum { hand: Hand::Master, direction: StrumDirection::Up, ms: 80 },
        Hold { ms: 300 },
        Release { finger: 1, ms: 150 },
        // Chord: neighbours leak onto each other, crosstalk cancellation must hold
        Press { finger: 0, ms: 120 },
        Press { finger: 2, ms: 120 },
        Strum { hand: Hand::Master, direction: StrumDirection::Down, ms: 80 },
        Hold { ms: 200 },
        Strum { hand: Hand::Master, direction: StrumDirection::Down, ms: 80 },
        Hold { ms: 400 },
        Release { finger: 2, ms: 120 },
        Release { finger: 0, ms: 120 },
        Press { finger: 3, ms: 150 },
        Strum { hand: Hand::Slave, direction: StrumDirection::Down, ms: 80 },
        Hold { ms: 400 },
        Release { finger: 3, ms: 150 },
        Hold { ms: 1000 },
    ]
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Smooth interpolation (ease in/out)
fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

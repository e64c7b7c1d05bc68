//! Output side of the scheduler: where finger vectors and strum hits go.

use crate::types::{FingerStates, Hand, StrumDirection, StrumEvent, FINGER_COLORS, NUM_FINGERS};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, trace, warn};
use std::fmt;
use std::io;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputEvent {
    /// Full 4-bit finger vector, sent only when it changes
    Fingers(FingerStates),
    Strum(StrumEvent),
}

impl fmt::Display for OutputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputEvent::Fingers(states) => {
                let bits: Vec<&str> = states.iter().map(|&b| if b { "1" } else { "0" }).collect();
                write!(f, "fingers [{}]", bits.join(","))
            }
            OutputEvent::Strum(s) => write!(f, "strum {} {}", s.hand, s.direction),
        }
    }
}

/// Consumer of scheduler output. Runs on the scheduler thread, so
/// implementations must not block; failures are logged, never propagated.
pub trait OutputSink: Send {
    fn send(&mut self, event: &OutputEvent);

    /// Called once when the scheduler stops.
    fn close(&mut self) {}
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn send(&mut self, event: &OutputEvent) {
        (**self).send(event)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// ─── Simple sinks ────────────────────────────────────────────────────────────

/// Forwards events into a crossbeam channel. Drops when the channel is full.
pub struct ChannelSink {
    tx: Sender<OutputEvent>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: Sender<OutputEvent>) -> Self {
        Self { tx, dropped: 0 }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl OutputSink for ChannelSink {
    fn send(&mut self, event: &OutputEvent) {
        match self.tx.try_send(*event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                trace!("output channel full, dropped {}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Logs every event at info level.
#[derive(Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn send(&mut self, event: &OutputEvent) {
        match event {
            OutputEvent::Fingers(states) => {
                let held: Vec<&str> = states
                    .iter()
                    .zip(FINGER_COLORS)
                    .filter(|(on, _)| **on)
                    .map(|(_, c)| c)
                    .collect();
                let held = if held.is_empty() {
                    "-".to_string()
                } else {
                    held.join("+")
                };
                info!("Fingers: {}", held);
            }
            OutputEvent::Strum(s) => {
                info!("Strum {} {} ({:.0})", s.hand, s.direction, s.projection)
            }
        }
    }
}

/// Broadcasts to several sinks in order.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn OutputSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl OutputSink for FanOut {
    fn send(&mut self, event: &OutputEvent) {
        for s in &mut self.sinks {
            s.send(event);
        }
    }

    fn close(&mut self) {
        for s in &mut self.sinks {
            s.close();
        }
    }
}

// ─── Button emulation ────────────────────────────────────────────────────────

/// Which virtual device the finger bits drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulation {
    Gamepad,
    Keyboard,
}

impl Emulation {
    /// Button names in finger order (Green, Red, Yellow, Blue).
    pub fn buttons(self) -> [&'static str; NUM_FINGERS] {
        match self {
            Emulation::Gamepad => ["A", "B", "Y", "X"],
            Emulation::Keyboard => ["a", "s", "j", "k"],
        }
    }

    pub fn strum_button(self, direction: StrumDirection) -> &'static str {
        match (self, direction) {
            (Emulation::Gamepad, StrumDirection::Down) => "DPAD_DOWN",
            (Emulation::Gamepad, StrumDirection::Up) => "DPAD_UP",
            (Emulation::Keyboard, StrumDirection::Down) => "down",
            (Emulation::Keyboard, StrumDirection::Up) => "up",
        }
    }
}

impl fmt::Display for Emulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Emulation::Gamepad => "gamepad",
            Emulation::Keyboard => "keyboard",
        })
    }
}

impl FromStr for Emulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gamepad" | "controller" => Ok(Emulation::Gamepad),
            "keyboard" => Ok(Emulation::Keyboard),
            other => Err(format!("unknown emulation '{}', use gamepad or keyboard", other)),
        }
    }
}

/// A virtual input device that can hold buttons down.
pub trait ButtonDevice: Send {
    fn press(&mut self, button: &str) -> io::Result<()>;
    fn release(&mut self, button: &str) -> io::Result<()>;
    /// Push a batch of changes (gamepad report); no-op for keyboards.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Device that only logs; used when no OS-level backend is wired in.
#[derive(Default)]
pub struct LogDevice;

impl ButtonDevice for LogDevice {
    fn press(&mut self, button: &str) -> io::Result<()> {
        info!("press {}", button);
        Ok(())
    }

    fn release(&mut self, button: &str) -> io::Result<()> {
        info!("release {}", button);
        Ok(())
    }
}

/// Turns finger vectors into press/release edges on a `ButtonDevice`.
///
/// Only transitions touch the device: 0→1 presses, 1→0 releases, an
/// unchanged bit does nothing. Strum hits are a press immediately followed
/// by a release of the direction button for the given hand layout.
pub struct ButtonEmulator<D: ButtonDevice> {
    device: D,
    mode: Emulation,
    held: FingerStates,
    /// Only strums from this hand are emulated; `None` taps for both
    strum_hand: Option<Hand>,
}

impl<D: ButtonDevice> ButtonEmulator<D> {
    pub fn new(device: D, mode: Emulation) -> Self {
        Self {
            device,
            mode,
            held: [false; NUM_FINGERS],
            strum_hand: None,
        }
    }

    pub fn strum_hand(mut self, hand: Option<Hand>) -> Self {
        self.strum_hand = hand;
        self
    }

    pub fn mode(&self) -> Emulation {
        self.mode
    }

    pub fn held(&self) -> FingerStates {
        self.held
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Switch layout. Anything held under the old layout is released first.
    pub fn set_mode(&mut self, mode: Emulation) {
        if mode == self.mode {
            return;
        }
        self.release_all();
        self.mode = mode;
        info!("Emulation switched to {}", mode);
    }

    pub fn update(&mut self, states: FingerStates) {
        if states == self.held {
            return;
        }
        debug!("emulator {:?} → {:?} ({})", self.held, states, self.mode);
        let buttons = self.mode.buttons();
        for i in 0..NUM_FINGERS {
            let result = match (self.held[i], states[i]) {
                (false, true) => self.device.press(buttons[i]),
                (true, false) => self.device.release(buttons[i]),
                _ => continue,
            };
            if let Err(e) = result {
                warn!("emulator {} {}: {}", self.mode, buttons[i], e);
            }
        }
        self.held = states;
        self.flush();
    }

    pub fn release_all(&mut self) {
        if !self.held.iter().any(|&h| h) {
            return;
        }
        let buttons = self.mode.buttons();
        for i in 0..NUM_FINGERS {
            if self.held[i] {
                if let Err(e) = self.device.release(buttons[i]) {
                    warn!("emulator release {}: {}", buttons[i], e);
                }
            }
        }
        self.held = [false; NUM_FINGERS];
        self.flush();
    }

    fn tap(&mut self, strum: &StrumEvent) {
        if self.strum_hand.map_or(false, |h| h != strum.hand) {
            return;
        }
        let button = self.mode.strum_button(strum.direction);
        if let Err(e) = self.press_release(button) {
            warn!("emulator strum {}: {}", button, e);
        }
    }

    fn press_release(&mut self, button: &str) -> io::Result<()> {
        self.device.press(button)?;
        self.device.flush()?;
        self.device.release(button)?;
        self.device.flush()
    }

    fn flush(&mut self) {
        if let Err(e) = self.device.flush() {
            warn!("emulator flush: {}", e);
        }
    }
}

impl<D: ButtonDevice> OutputSink for ButtonEmulator<D> {
    fn send(&mut self, event: &OutputEvent) {
        match event {
            OutputEvent::Fingers(states) => self.update(*states),
            OutputEvent::Strum(s) => self.tap(s),
        }
    }

    fn close(&mut self) {
        self.release_all();
    }
}

impl<D: ButtonDevice> Drop for ButtonEmulator<D> {
    fn drop(&mut self) {
        self.release_all();
    }
}

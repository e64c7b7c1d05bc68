use crate::finger::FingerEngine;
use crate::mapping::MappingStore;
use crate::sink::{OutputEvent, OutputSink};
use crate::strum::StrumEngine;
use crate::telemetry::TelemetryReader;
use crate::types::{InstrumentState, Snapshot, NUM_FINGERS};
use log::{debug, info, trace};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on how long a stop request can go unnoticed.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

impl SchedulerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }
}

/// Drives both detection engines from the telemetry feed and forwards the
/// combined result to an output sink.
///
/// Each wake-up takes the latest snapshot and the current mapping set once,
/// so a calibration landing mid-tick is seen whole on the next tick. A
/// snapshot that was already processed (same `Arc`) is skipped.
pub struct Scheduler<S: OutputSink> {
    fingers: FingerEngine,
    strums: StrumEngine,
    store: MappingStore,
    sink: S,
    last: Option<Arc<Snapshot>>,
    held: bool,
    ticks: u64,
}

impl<S: OutputSink> Scheduler<S> {
    pub fn new(fingers: FingerEngine, strums: StrumEngine, store: MappingStore, sink: S) -> Self {
        Self {
            fingers,
            strums,
            store,
            sink,
            last: None,
            held: false,
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Process one snapshot now. Returns `None` when it was already seen.
    pub fn tick(&mut self, snapshot: &Arc<Snapshot>) -> Option<InstrumentState> {
        self.tick_at(Instant::now(), snapshot)
    }

    pub fn tick_at(&mut self, now: Instant, snapshot: &Arc<Snapshot>) -> Option<InstrumentState> {
        if let Some(prev) = &self.last {
            if Arc::ptr_eq(prev, snapshot) {
                return None;
            }
        }
        self.last = Some(Arc::clone(snapshot));
        self.ticks += 1;

        let mappings = self.store.current();
        let update = self.fingers.process(snapshot, &mappings);
        let strums = self.strums.process_at(now, snapshot, &mappings);

        if update.changed {
            self.held = update.states.iter().any(|&b| b);
            self.sink.send(&OutputEvent::Fingers(update.states));
        }
        for s in &strums {
            self.sink.send(&OutputEvent::Strum(*s));
        }

        let state = InstrumentState {
            fingers: update.states,
            strums,
        };
        if self.ticks % 1000 == 0 {
            debug!("Scheduler: {} ticks", self.ticks);
            trace!("Latest: {}", state);
        }
        Some(state)
    }

    /// Release anything still held and close the sink.
    pub fn finish(&mut self) {
        if self.held {
            self.sink.send(&OutputEvent::Fingers([false; NUM_FINGERS]));
            self.held = false;
        }
        self.sink.close();
    }

    /// Blocking loop. Returns once `stop` is set.
    pub fn run(&mut self, reader: &TelemetryReader, stop: &AtomicBool) {
        info!("Scheduler running");
        while !stop.load(Ordering::Acquire) {
            if !reader.wait_for_update(WAIT_TIMEOUT) {
                continue;
            }
            if let Some(snapshot) = reader.latest_snapshot() {
                self.tick(&snapshot);
            }
        }
        self.finish();
        info!("Scheduler stopped after {} ticks", self.ticks);
    }
}

impl<S: OutputSink + 'static> Scheduler<S> {
    /// Run on a dedicated thread until the handle is stopped or dropped.
    pub fn spawn(mut self, reader: TelemetryReader) -> io::Result<SchedulerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(SchedulerState::Idle as u8));

        let thread_stop = Arc::clone(&stop);
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                thread_state.store(SchedulerState::Running as u8, Ordering::Release);
                self.run(&reader, &thread_stop);
                thread_state.store(SchedulerState::Stopped as u8, Ordering::Release);
            })?;

        Ok(SchedulerHandle {
            stop,
            state,
            thread: Some(thread),
        })
    }
}

pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Request stop and wait for the loop to exit (at most one wait timeout).
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FingerConfig, StrumConfig};
    use crate::mapping::{FingerMapping, Mapping, MappingSet};
    use crate::sink::ChannelSink;
    use crate::types::{Action, FingerId};
    use crossbeam_channel::{bounded, Receiver};
    use std::collections::BTreeMap;

    fn store() -> MappingStore {
        let mut set = MappingSet::new();
        set.insert(
            Action::Finger(FingerId::new(0).unwrap()),
            Mapping::Finger(FingerMapping {
                sensor_key: "adc_v32".into(),
                rest_value: 4095.0,
                half: 2048.0,
                full_value: 500.0,
                crosstalk_reference: BTreeMap::new(),
            }),
        )
        .unwrap();
        MappingStore::in_memory(set)
    }

    fn scheduler() -> (Scheduler<ChannelSink>, Receiver<OutputEvent>) {
        let (tx, rx) = bounded(16);
        let sched = Scheduler::new(
            FingerEngine::new(FingerConfig {
                alpha: 1.0,
                ..Default::default()
            }),
            StrumEngine::new(StrumConfig::default()),
            store(),
            ChannelSink::new(tx),
        );
        (sched, rx)
    }

    fn flex(v: f64) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(0).with("adc_v32", v))
    }

    #[test]
    fn test_only_changes_are_sent() {
        let (mut sched, rx) = scheduler();
        sched.tick(&flex(4095.0));
        sched.tick(&flex(4000.0));
        sched.tick(&flex(600.0));
        sched.tick(&flex(550.0));
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![OutputEvent::Fingers([true, false, false, false])]);
    }

    #[test]
    fn test_same_snapshot_skipped() {
        let (mut sched, _rx) = scheduler();
        let snap = flex(600.0);
        assert!(sched.tick(&snap).is_some());
        assert!(sched.tick(&snap).is_none());
        assert!(sched.tick(&flex(600.0)).is_some(), "equal content, new snapshot");
        assert_eq!(sched.ticks(), 2);
    }

    #[test]
    fn test_finish_releases_held() {
        let (mut sched, rx) = scheduler();
        sched.tick(&flex(500.0));
        sched.finish();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                OutputEvent::Fingers([true, false, false, false]),
                OutputEvent::Fingers([false; 4]),
            ]
        );
    }

    #[test]
    fn test_finish_quiet_when_nothing_held() {
        let (mut sched, rx) = scheduler();
        sched.tick(&flex(4095.0));
        sched.finish();
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(SchedulerState::from_u8(0), SchedulerState::Idle);
        assert_eq!(SchedulerState::from_u8(1), SchedulerState::Running);
        assert_eq!(SchedulerState::from_u8(2), SchedulerState::Stopped);
    }
}

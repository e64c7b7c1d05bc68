use glove_capture::calibrator;
use glove_capture::config::{CalibrationConfig, EngineConfig, FingerConfig, StrumConfig};
use glove_capture::finger::FingerEngine;
use glove_capture::mapping::{MappingStore, DEFAULT_MAPPING_FILE};
use glove_capture::osc_sender::OscSink;
use glove_capture::scheduler::{Scheduler, SchedulerState};
use glove_capture::simulator::Simulator;
use glove_capture::sink::{ButtonEmulator, Emulation, FanOut, LogDevice, LogSink};
use glove_capture::strum::StrumEngine;
use glove_capture::telemetry::{TelemetryChannel, Transport, DEFAULT_TCP_HOST, DEFAULT_UDP_BIND};
use glove_capture::types::*;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TransportKind {
    /// Binary records over UDP
    Udp,
    /// JSON lines over TCP
    Tcp,
}

#[derive(Parser)]
#[command(name = "glove-capture")]
#[command(about = "Flex-sensor glove to game controller: calibration, finger and strum detection")]
struct Cli {
    /// Telemetry transport
    #[arg(long, value_enum, default_value_t = TransportKind::Udp)]
    transport: TransportKind,

    /// UDP listen address
    #[arg(long, default_value = DEFAULT_UDP_BIND)]
    bind: String,

    /// TCP glove address
    #[arg(long, default_value = DEFAULT_TCP_HOST)]
    connect: String,

    /// Mapping file (created on first calibration)
    #[arg(long, default_value = DEFAULT_MAPPING_FILE)]
    mappings: PathBuf,

    /// EMA weight of the newest flex sample
    #[arg(long, default_value_t = 0.35)]
    alpha: f64,

    /// Activation that presses a finger
    #[arg(long, default_value_t = 0.5)]
    trigger: f64,

    /// Activation that releases a pressed finger
    #[arg(long, default_value_t = 0.35)]
    release: f64,

    /// Crosstalk cancellation strength (0 disables)
    #[arg(long, default_value_t = 1.0)]
    crosstalk_gain: f64,

    /// Minimum time between strums of one hand
    #[arg(long, default_value_t = 120)]
    cooldown_ms: u64,

    /// Strum threshold as a fraction of the calibrated peak
    #[arg(long, default_value_t = 0.4)]
    strum_k: f64,

    /// Minimum flex swing accepted by finger calibration (raw units)
    #[arg(long, default_value_t = 100.0)]
    noise_floor: f64,

    /// Output device layout: gamepad (A,B,Y,X) or keyboard (a,s,j,k)
    #[arg(long, default_value = "gamepad")]
    emulation: Emulation,

    /// Also log every output event
    #[arg(long)]
    log_events: bool,

    /// Enable OSC output
    #[arg(long)]
    osc: bool,

    /// OSC target address
    #[arg(long, default_value = "127.0.0.1:9000")]
    osc_target: String,

    /// Calibrate one action (finger1..finger4, strum_master, strum_slave) and exit
    #[arg(long)]
    calibrate: Option<Action>,

    /// Run the built-in glove simulator alongside
    #[arg(long)]
    simulate: bool,

    /// Where the simulator sends its packets
    #[arg(long, default_value = "127.0.0.1:8888")]
    sim_target: String,

    /// Simulator packet rate (Hz)
    #[arg(long, default_value_t = 100)]
    sim_rate: u32,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            finger: FingerConfig {
                alpha: self.alpha,
                trigger_threshold: self.trigger,
                release_threshold: self.release,
                crosstalk_gain: self.crosstalk_gain,
                ..Default::default()
            },
            strum: StrumConfig {
                cooldown: Duration::from_millis(self.cooldown_ms),
            },
            calibration: CalibrationConfig {
                noise_floor: self.noise_floor,
                strum_threshold_fraction: self.strum_k,
                ..Default::default()
            },
        }
    }

    fn transport(&self) -> Transport {
        match self.transport {
            TransportKind::Udp => Transport::Udp {
                bind: self.bind.clone(),
            },
            TransportKind::Tcp => Transport::Tcp {
                connect: self.connect.clone(),
            },
        }
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    let config = cli.engine_config();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        process::exit(2);
    }
    let clock = SessionClock::new();
    let transport = cli.transport();

    info!("═══════════════════════════════════════════════");
    info!("  GLOVE CAPTURE v{}", env!("CARGO_PKG_VERSION"));
    info!("  Telemetry: {:?}", transport);
    info!("  Mappings: {}", cli.mappings.display());
    info!("  Output: {}{}", cli.emulation, if cli.osc { " + OSC" } else { "" });
    if cli.simulate {
        info!("  Simulator → {} at {} Hz", cli.sim_target, cli.sim_rate);
    }
    info!("═══════════════════════════════════════════════");

    let store = MappingStore::open(&cli.mappings);
    let loaded = store.current();
    info!("Loaded {} mapping(s)", loaded.len());
    for (action, mapping) in loaded.iter() {
        info!("  {} → {}", action, mapping.source_key());
    }

    // ─── Simulator (optional) ───────────────────────────────────────
    let mut handles = Vec::new();
    let sim_stop = if cli.simulate {
        match Simulator::new(cli.sim_target.clone(), cli.sim_rate, clock.clone()) {
            Ok(mut sim) => {
                let stop = sim.stop_flag();
                handles.push(thread::Builder::new().name("simulator".into()).spawn(move || {
                    if let Err(e) = sim.run_forever() {
                        error!("Simulator failed: {}", e);
                    }
                }).unwrap());
                Some(stop)
            }
            Err(e) => {
                error!("Simulator socket: {}", e);
                None
            }
        }
    } else {
        None
    };

    // ─── Telemetry ──────────────────────────────────────────────────
    let mut channel = TelemetryChannel::new(transport, clock);
    channel.connect();

    // ─── Calibration mode ───────────────────────────────────────────
    if let Some(action) = cli.calibrate {
        let reader = channel.reader();
        // Give the first packets a moment to land
        reader.wait_for_update(Duration::from_secs(2));
        let result = calibrator::run_interactive(&reader, store, config.calibration, action);
        channel.disconnect();
        if let Some(stop) = sim_stop {
            stop.store(true, std::sync::atomic::Ordering::Release);
        }
        match result {
            Ok(_) => info!("Saved to {}", cli.mappings.display()),
            Err(e) => {
                error!("Calibration of {} failed: {}", action, e);
                process::exit(1);
            }
        }
        return;
    }

    // ─── Output sinks ───────────────────────────────────────────────
    let mut sinks = FanOut::new().with(ButtonEmulator::new(LogDevice, cli.emulation));
    if cli.log_events {
        sinks = sinks.with(LogSink);
    }
    if cli.osc {
        match OscSink::new(cli.osc_target.clone()) {
            Ok(osc) => sinks = sinks.with(osc),
            Err(e) => warn!("OSC disabled: {}", e),
        }
    }

    // ─── Scheduler ──────────────────────────────────────────────────
    let scheduler = Scheduler::new(
        FingerEngine::new(config.finger.clone()),
        StrumEngine::new(config.strum.clone()),
        store,
        sinks,
    );
    let mut handle = scheduler.spawn(channel.reader()).unwrap();

    info!("Running. Press Ctrl+C to stop.");
    let mut last_status = String::new();
    while handle.state() != SchedulerState::Stopped {
        let status = channel.status();
        if status != last_status {
            info!("Telemetry: {}", status);
            last_status = status;
        }
        thread::sleep(Duration::from_millis(500));
    }

    handle.stop();
    channel.disconnect();
    for h in handles {
        let _ = h.join();
    }
}

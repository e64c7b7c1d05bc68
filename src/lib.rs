pub mod calibrator;
pub mod config;
pub mod dsp;
pub mod finger;
pub mod mapping;
pub mod osc_sender;
pub mod packet;
pub mod scheduler;
pub mod simulator;
pub mod sink;
pub mod strum;
pub mod telemetry;
pub mod types;

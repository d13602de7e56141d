//! Component configuration.
//!
//! Configuration-file / environment loading is an external collaborator
//! (spec §1 Non-goals) — this module only defines the shape a loader
//! would populate and the fixed defaults from spec §6. Every component
//! receives its config by constructor argument, never through process-
//! wide state (design note §9).

use std::time::Duration;

/// Serial transport to the peripheral microcontroller.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity_odd: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS3".to_string(),
            baud: 115_200,
            data_bits: 8,
            stop_bits: 2,
            parity_odd: true,
        }
    }
}

/// Algorithm device (line-oriented, `algo -b <bet> -p <prize>`).
#[derive(Debug, Clone)]
pub struct AlgoConfig {
    pub port: String,
    pub baud: u32,
    pub timer_enabled: bool,
    pub interval: Duration,
    pub bet: i64,
    pub prize: i64,
}

impl Default for AlgoConfig {
    fn default() -> Self {
        Self {
            port: "auto".to_string(),
            baud: 115_200,
            timer_enabled: false,
            interval: Duration::from_secs(5),
            bet: 1,
            prize: 100,
        }
    }
}

/// Device controller timing knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub echo_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            echo_timeout: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Session manager / recovery engine timing knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub max_sessions: usize,
    pub idle_reaper_interval: Duration,
    /// Ready-state staleness limit before the recovery engine treats a
    /// `Ready` snapshot as timed out (spec §4.6 continuation table).
    pub ready_stale_limit: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30 * 60),
            max_sessions: 100,
            idle_reaper_interval: Duration::from_secs(5 * 60),
            ready_stale_limit: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level configuration bundle handed to the binary's wiring code.
#[derive(Debug, Clone, Default)]
pub struct CabinetConfig {
    pub serial: SerialConfig,
    pub algo: AlgoConfig,
    pub controller: ControllerConfig,
    pub session: SessionConfig,
}

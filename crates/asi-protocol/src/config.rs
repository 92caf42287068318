//! Device configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{BUS_MAX_ADDRESS, LOGGING_DEFAULT_INTERVAL_MS};

// ============================================================================
// Configuration Types
// ============================================================================

/// Role of a device on the shared bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum DeviceMode {
    /// No bus; telegrams carry local signals only.
    #[default]
    Standalone,
    /// Polls subordinates and appends their signals to its own telegrams.
    Controller {
        /// Bus clock requested from the transport.
        #[serde(default = "default_clock_hz")]
        clock_hz: u32,
    },
    /// Answers a controller's requests at `address`.
    Subordinate { address: u8 },
}

fn default_clock_hz() -> u32 {
    100_000
}

impl DeviceMode {
    /// Subordinate addresses above the 7-bit range are clamped.
    pub fn subordinate(address: u8) -> Self {
        DeviceMode::Subordinate {
            address: address.min(BUS_MAX_ADDRESS),
        }
    }

    /// Controller polling the bus at `clock_hz`.
    pub fn controller(clock_hz: u32) -> Self {
        DeviceMode::Controller { clock_hz }
    }

    /// Subordinate address, clamped.
    pub fn address(&self) -> Option<u8> {
        match *self {
            DeviceMode::Subordinate { address } => Some(address.min(BUS_MAX_ADDRESS)),
            _ => None,
        }
    }

    /// Whether this device polls subordinates.
    pub fn is_controller(&self) -> bool {
        matches!(self, DeviceMode::Controller { .. })
    }

    /// Prefix applied to every signal name a subordinate registers.
    pub fn name_prefix(&self) -> String {
        match self.address() {
            Some(address) => format!("S{}_", address),
            None => String::new(),
        }
    }
}

/// Scheduler settings applied when the device is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub active: bool,
    pub interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            active: false,
            interval_ms: LOGGING_DEFAULT_INTERVAL_MS,
        }
    }
}

/// Configuration for an [`AsiDevice`](crate::AsiDevice).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Registry capacity.
    pub max_signal_count: usize,
    pub mode: DeviceMode,
    pub logging: LoggingConfig,
    /// Echo every completed frame back as `<payload>\r\n` before dispatch.
    pub echo_commands: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            max_signal_count: 32,
            mode: DeviceMode::Standalone,
            logging: LoggingConfig::default(),
            echo_commands: true,
        }
    }
}

impl DeviceConfig {
    /// Set the bus role.
    pub fn with_mode(mut self, mode: DeviceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the registry capacity.
    pub fn with_max_signal_count(mut self, count: usize) -> Self {
        self.max_signal_count = count;
        self
    }

    /// Set the scheduler state applied at construction.
    pub fn with_logging(mut self, active: bool, interval_ms: u64) -> Self {
        self.logging = LoggingConfig { active, interval_ms };
        self
    }

    /// Enable or disable echoing completed frames.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_commands = echo;
        self
    }
}

//! Bench descriptions.
//!
//! A bench is a YAML file describing one device on the host's serial port,
//! plus any subordinates on its bus:
//!
//! ```yaml
//! device:
//!   mode: { role: controller }
//!   signals:
//!     - { name: temperature, type: float, value: 21.5 }
//! subordinates:
//!   - address: 2
//!     signals:
//!       - { name: rpm, type: unsigned_int, value: 1200 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use asi_protocol::{
    AsiDevice, BusResponder, Command, DeviceConfig, DeviceMode, ProtocolCommand, ResponseBuffer,
    SignalBinding, SignalType, Telegram, TelegramDecoder,
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::SimBus;
use crate::clock::ManualClock;
use crate::error::{SimError, SimResult};
use crate::serial::MemorySerial;

// ============================================================================
// Bench Description
// ============================================================================

/// One signal with a fixed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default)]
    pub value: f64,
}

/// The device attached to the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(flatten)]
    pub config: DeviceConfig,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
}

/// A subordinate on the controller's bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubordinateSpec {
    pub address: u8,
    #[serde(default = "default_max_signal_count")]
    pub max_signal_count: usize,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
}

fn default_max_signal_count() -> usize {
    DeviceConfig::default().max_signal_count
}

/// A complete bench.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bench {
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default)]
    pub subordinates: Vec<SubordinateSpec>,
}

/// Device type used throughout the harness.
pub type SimDevice = AsiDevice<MemorySerial, ManualClock>;

impl Bench {
    /// Parse a bench from YAML text.
    pub fn from_yaml_str(yaml: &str) -> SimResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a bench file.
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Check addresses before anything is built.
    pub fn validate(&self) -> SimResult<()> {
        let mut seen = HashSet::new();
        for sub in &self.subordinates {
            if sub.address > asi_protocol::constants::BUS_MAX_ADDRESS {
                return Err(SimError::InvalidBench(format!(
                    "subordinate address {} is outside 0..=127",
                    sub.address
                )));
            }
            if !seen.insert(sub.address) {
                return Err(SimError::InvalidBench(format!(
                    "subordinate address {} used twice",
                    sub.address
                )));
            }
        }
        if !self.subordinates.is_empty() && !self.device.config.mode.is_controller() {
            warn!("bench has subordinates but the device is not a controller; they will not be polled");
        }
        Ok(())
    }

    /// Create every device and wire them up.
    pub fn build(&self) -> SimResult<BenchRig> {
        self.validate()?;

        let serial = MemorySerial::new();
        let clock = ManualClock::new();
        let bus = SimBus::new();

        let mut subordinates = Vec::with_capacity(self.subordinates.len());
        for spec in &self.subordinates {
            let config = DeviceConfig::default()
                .with_mode(DeviceMode::subordinate(spec.address))
                .with_max_signal_count(spec.max_signal_count)
                .with_echo(false);
            let mut device = AsiDevice::with_clock(config, MemorySerial::new(), clock.clone());
            register_signals(&mut device, &spec.signals)?;
            debug!(address = spec.address, signals = spec.signals.len(), "subordinate attached");

            let subordinate = Arc::new(SimSubordinate::new(spec.address, device));
            bus.attach(spec.address, subordinate.clone());
            subordinates.push(subordinate);
        }

        let mut device = AsiDevice::with_clock(self.device.config.clone(), serial.clone(), clock.clone())
            .with_handler(|command: &Command| {
                info!(command = %command.name, params = ?command.params, "application command");
            });
        if self.device.config.mode.is_controller() {
            device = device.with_bus(bus.clone());
        }
        register_signals(&mut device, &self.device.signals)?;

        Ok(BenchRig {
            device,
            serial,
            clock,
            bus,
            subordinates,
            decoder: TelegramDecoder::new(),
        })
    }
}

fn register_signals(device: &mut SimDevice, signals: &[SignalSpec]) -> SimResult<()> {
    for signal in signals {
        let value = signal.value;
        device.register(
            &signal.name,
            SignalBinding::from_f64_source(signal.signal_type, move || value),
        )?;
    }
    Ok(())
}

// ============================================================================
// Subordinates
// ============================================================================

/// A subordinate device attached to the bench bus.
pub struct SimSubordinate {
    address: u8,
    device: Mutex<SimDevice>,
}

impl SimSubordinate {
    /// Wrap a device for attachment at `address`.
    pub fn new(address: u8, device: SimDevice) -> Self {
        SimSubordinate {
            address,
            device: Mutex::new(device),
        }
    }

    /// Bus address the subordinate answers on.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Lock the device for inspection or reconfiguration.
    pub fn device(&self) -> MutexGuard<'_, SimDevice> {
        self.device.lock()
    }
}

impl std::fmt::Debug for SimSubordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSubordinate")
            .field("address", &self.address)
            .finish()
    }
}

impl BusResponder for SimSubordinate {
    fn on_receive(&self, data: &[u8]) {
        self.device.lock().on_receive(data)
    }

    fn on_request(&self, response: &mut ResponseBuffer) {
        self.device.lock().on_request(response)
    }
}

// ============================================================================
// Running Bench
// ============================================================================

/// A built bench: the host-facing device and everything around it.
pub struct BenchRig {
    pub device: SimDevice,
    /// Host side of the device's serial port.
    pub serial: MemorySerial,
    pub clock: ManualClock,
    pub bus: SimBus,
    pub subordinates: Vec<Arc<SimSubordinate>>,
    decoder: TelegramDecoder,
}

impl BenchRig {
    /// Send raw bytes and handle every complete command they contain.
    pub fn send(&mut self, bytes: &[u8]) -> Vec<ProtocolCommand> {
        self.serial.send(bytes);
        std::iter::from_fn(|| self.device.read()).collect()
    }

    /// Send one command.
    pub fn send_command(&mut self, command: &ProtocolCommand) -> Vec<ProtocolCommand> {
        self.send(&command.to_command().encode())
    }

    /// Advance the clock `ticks` times by `tick_ms`, ticking the scheduler
    /// after each step. Returns how many data telegrams were sent.
    pub fn run_ticks(&mut self, ticks: usize, tick_ms: u64, message_id: u32) -> usize {
        let mut fired = 0;
        for _ in 0..ticks {
            if self.device.tick(message_id) {
                fired += 1;
            }
            self.clock.advance(tick_ms);
        }
        fired
    }

    /// Decode everything the device wrote since the last call.
    ///
    /// Data telegrams decode against the most recent symbol list seen by
    /// this rig.
    pub fn telegrams(&mut self) -> SimResult<Vec<Telegram>> {
        let output = self.serial.take_output();
        self.decoder.push(&output);
        let telegrams = self
            .decoder
            .decode_all()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(telegrams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BENCH: &str = r#"
device:
  mode: { role: controller, clock_hz: 400000 }
  echo_commands: false
  signals:
    - { name: temperature, type: float, value: 21.5 }
subordinates:
  - address: 2
    signals:
      - { name: rpm, type: unsigned_int, value: 1200 }
"#;

    #[test]
    fn test_parse_bench() {
        let bench = Bench::from_yaml_str(BENCH).unwrap();
        assert_eq!(bench.device.config.mode, DeviceMode::Controller { clock_hz: 400_000 });
        assert!(!bench.device.config.echo_commands);
        assert_eq!(bench.device.config.max_signal_count, 32);
        assert_eq!(bench.device.signals[0].signal_type, SignalType::Float);
        assert_eq!(bench.subordinates[0].address, 2);
        assert_eq!(bench.subordinates[0].max_signal_count, 32);
    }

    #[test]
    fn test_empty_bench_is_standalone() {
        let bench = Bench::from_yaml_str("{}").unwrap();
        assert_eq!(bench.device.config.mode, DeviceMode::Standalone);
        assert!(bench.subordinates.is_empty());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut bench = Bench::from_yaml_str(BENCH).unwrap();
        bench.subordinates.push(bench.subordinates[0].clone());
        assert!(matches!(bench.build(), Err(SimError::InvalidBench(_))));
    }

    #[test]
    fn test_address_out_of_range_rejected() {
        let mut bench = Bench::from_yaml_str(BENCH).unwrap();
        bench.subordinates[0].address = 128;
        assert!(matches!(bench.validate(), Err(SimError::InvalidBench(_))));
    }

    #[test]
    fn test_build_attaches_subordinates() {
        let rig = Bench::from_yaml_str(BENCH).unwrap().build().unwrap();
        assert_eq!(rig.bus.addresses(), vec![2]);
        let sub = &rig.subordinates[0];
        assert_eq!(sub.address(), 2);
        assert_eq!(sub.device().registry().get(0).unwrap().name(), "S2_rpm");
    }
}

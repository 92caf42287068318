//! The device-side protocol object.
//!
//! [`AsiDevice`] ties the pieces together: it reads command frames from the
//! serial port, dispatches them, emits telegrams (locally or through the bus
//! aggregator, depending on [`DeviceMode`]), runs the logging scheduler, and
//! in subordinate mode answers the controller through [`BusResponder`].

use asi_metrics::{metric_defs, metrics};

use crate::bus::{respond, AggregationReport, BusAggregator, BusResponder, BusTransport, ResponseBuffer, SubordinateState};
use crate::command::{Command, CommandFramer, ProtocolCommand};
use crate::config::{DeviceConfig, DeviceMode};
use crate::error::ProtocolResult;
use crate::registry::{SignalBinding, SignalRegistry};
use crate::scheduler::LoggingScheduler;
use crate::telegram::{encode_data, encode_symbols};
use crate::transport::{Clock, SerialPort, SystemClock};

/// Receives commands the protocol itself does not handle.
pub trait CommandHandler {
    fn handle(&mut self, command: &Command);
}

impl<F> CommandHandler for F
where
    F: FnMut(&Command),
{
    fn handle(&mut self, command: &Command) {
        self(command)
    }
}

/// A protocol endpoint on one serial port.
pub struct AsiDevice<P, C = SystemClock> {
    config: DeviceConfig,
    registry: SignalRegistry,
    framer: CommandFramer,
    scheduler: LoggingScheduler,
    responder: SubordinateState,
    aggregator: BusAggregator,
    serial: P,
    clock: C,
    bus: Option<Box<dyn BusTransport + Send>>,
    handler: Option<Box<dyn CommandHandler + Send>>,
    last_report: Option<AggregationReport>,
}

impl<P: SerialPort> AsiDevice<P, SystemClock> {
    /// Create a device using the system clock.
    pub fn new(config: DeviceConfig, serial: P) -> Self {
        Self::with_clock(config, serial, SystemClock::new())
    }
}

impl<P: SerialPort, C: Clock> AsiDevice<P, C> {
    /// Create a device with an explicit clock.
    pub fn with_clock(config: DeviceConfig, serial: P, clock: C) -> Self {
        let registry =
            SignalRegistry::new(config.max_signal_count).with_name_prefix(config.mode.name_prefix());
        let mut device = AsiDevice {
            registry,
            framer: CommandFramer::new(),
            scheduler: LoggingScheduler::new(),
            responder: SubordinateState::new(),
            aggregator: BusAggregator::new(),
            serial,
            clock,
            bus: None,
            handler: None,
            last_report: None,
            config,
        };
        let logging = device.config.logging;
        device.set_logging(logging.active, logging.interval_ms);
        log::debug!(
            "device created: mode={:?} capacity={}",
            device.config.mode,
            device.registry.capacity()
        );
        device
    }

    /// Attach the bus used in controller mode.
    pub fn with_bus(mut self, bus: impl BusTransport + Send + 'static) -> Self {
        self.bus = Some(Box::new(bus));
        self
    }

    /// Attach the handler for application commands.
    pub fn with_handler(mut self, handler: impl CommandHandler + Send + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration the device was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Bus role.
    pub fn mode(&self) -> DeviceMode {
        self.config.mode
    }

    /// Registered signals.
    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    /// Logging scheduler state.
    pub fn scheduler(&self) -> &LoggingScheduler {
        &self.scheduler
    }

    /// The serial port.
    pub fn serial(&self) -> &P {
        &self.serial
    }

    /// The serial port, mutably.
    pub fn serial_mut(&mut self) -> &mut P {
        &mut self.serial
    }

    /// The clock driving the scheduler.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Bus addresses found by the last symbol pass (controller mode).
    pub fn roster(&self) -> Vec<u8> {
        self.aggregator.roster()
    }

    /// Report of the most recent aggregation pass (controller mode).
    pub fn last_report(&self) -> Option<&AggregationReport> {
        self.last_report.as_ref()
    }

    // ========================================================================
    // Signal Registration
    // ========================================================================

    /// Register a signal. In subordinate mode the name gets the `S<addr>_` prefix.
    pub fn register(&mut self, name: &str, binding: SignalBinding) -> ProtocolResult<usize> {
        let index = self.registry.register(name, binding)?;
        log::debug!("registered signal {} as index {}", name, index);
        Ok(index)
    }

    pub fn register_bool(&mut self, name: &str, f: impl Fn() -> bool + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::bool(f))
    }

    pub fn register_byte(&mut self, name: &str, f: impl Fn() -> u8 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::byte(f))
    }

    pub fn register_short(&mut self, name: &str, f: impl Fn() -> i16 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::short(f))
    }

    pub fn register_int(&mut self, name: &str, f: impl Fn() -> i16 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::int(f))
    }

    pub fn register_unsigned_int(&mut self, name: &str, f: impl Fn() -> u16 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::unsigned_int(f))
    }

    pub fn register_long(&mut self, name: &str, f: impl Fn() -> i32 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::long(f))
    }

    pub fn register_unsigned_long(&mut self, name: &str, f: impl Fn() -> u32 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::unsigned_long(f))
    }

    pub fn register_float(&mut self, name: &str, f: impl Fn() -> f32 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::float(f))
    }

    pub fn register_double(&mut self, name: &str, f: impl Fn() -> f64 + Send + Sync + 'static) -> ProtocolResult<usize> {
        self.register(name, SignalBinding::double(f))
    }

    /// Drop every registered signal. Hosts must re-request the symbol list.
    pub fn delete_signals(&mut self) {
        self.registry.clear();
    }

    // ========================================================================
    // Command Handling
    // ========================================================================

    /// Drain the serial port and handle the first well-formed command found.
    ///
    /// Malformed frames are logged and dropped. Bytes after a handled frame
    /// stay queued for the next call.
    pub fn read(&mut self) -> Option<ProtocolCommand> {
        while self.framer.poll(&mut self.serial) {
            let command = match self.framer.parse() {
                Ok(command) => command,
                Err(e) => {
                    log::warn!(
                        "dropping command frame {:?}: {}",
                        String::from_utf8_lossy(self.framer.payload()),
                        e
                    );
                    metrics::counter!(metric_defs::COMMAND_FRAMES.name, "outcome" => "malformed")
                        .increment(1);
                    continue;
                }
            };
            metrics::counter!(metric_defs::COMMAND_FRAMES.name, "outcome" => "ok").increment(1);

            if self.config.echo_commands {
                self.serial.write_all(b"<");
                self.serial.write_all(self.framer.payload());
                self.serial.write_all(b">\r\n");
                self.serial.flush();
            }

            let command = ProtocolCommand::from_command(command);
            self.dispatch(&command);
            return Some(command);
        }
        None
    }

    /// Act on a command as if it had arrived on the serial port.
    pub fn dispatch(&mut self, command: &ProtocolCommand) {
        log::debug!("dispatching {}", command.name());
        metrics::counter!(metric_defs::COMMAND_DISPATCHED.name, "command" => command.name().to_string())
            .increment(1);

        match command {
            ProtocolCommand::GetSignalList { message_id } => {
                self.transmit_symbols(*message_id);
            }
            ProtocolCommand::GetData { message_id } => {
                self.transmit_data(*message_id);
            }
            ProtocolCommand::Activate { interval_s } => {
                self.scheduler.activate_seconds(*interval_s);
                log::debug!("logging activated every {} ms", self.scheduler.interval_ms());
            }
            ProtocolCommand::Deactivate => {
                self.scheduler.deactivate();
            }
            ProtocolCommand::Other(command) => match self.handler.as_mut() {
                Some(handler) => handler.handle(command),
                None => log::debug!("no handler for command {}", command.name),
            },
        }
    }

    // ========================================================================
    // Telegrams
    // ========================================================================

    /// Emit a terminal symbol-list telegram. Returns the bytes written.
    pub fn transmit_symbols(&mut self, message_id: u32) -> usize {
        if self.config.mode.is_controller() {
            if let Some(bus) = self.bus.as_deref_mut() {
                let report = self.aggregator.transmit_symbols(
                    &self.registry,
                    message_id,
                    true,
                    bus,
                    &mut self.serial,
                );
                let written = report.bytes_written;
                self.last_report = Some(report);
                return written;
            }
            log::warn!("controller has no bus attached, sending local symbols only");
        }
        encode_symbols(&self.registry, message_id, true, &mut self.serial)
    }

    /// Emit a terminal data telegram. Returns the bytes written.
    pub fn transmit_data(&mut self, message_id: u32) -> usize {
        if self.config.mode.is_controller() {
            if let Some(bus) = self.bus.as_deref_mut() {
                let report = self.aggregator.transmit_data(
                    &self.registry,
                    message_id,
                    true,
                    bus,
                    &mut self.serial,
                );
                let written = report.bytes_written;
                self.last_report = Some(report);
                return written;
            }
            log::warn!("controller has no bus attached, sending local data only");
        }
        encode_data(&self.registry, message_id, true, &mut self.serial)
    }

    // ========================================================================
    // Periodic Logging
    // ========================================================================

    /// Set the scheduler directly. The interval is kept when deactivating.
    pub fn set_logging(&mut self, active: bool, interval_ms: u64) {
        self.scheduler.activate(interval_ms);
        if !active {
            self.scheduler.deactivate();
        }
    }

    /// Run one scheduler tick; emits a data telegram when one is due.
    pub fn tick(&mut self, message_id: u32) -> bool {
        let now = self.clock.now_ms();
        if !self.scheduler.tick(now) {
            return false;
        }
        metrics::counter!(metric_defs::LOGGING_FIRED.name).increment(1);
        log::trace!("logging tick fired at {} ms", now);
        self.transmit_data(message_id);
        true
    }
}

impl<P, C> BusResponder for AsiDevice<P, C> {
    fn on_receive(&self, data: &[u8]) {
        match data.first() {
            Some(&request) => self.responder.record_request(request),
            None => log::warn!("empty bus request ignored"),
        }
    }

    fn on_request(&self, response: &mut ResponseBuffer) {
        respond(&self.registry, &self.responder, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::message_id_to_params;
    use crate::constants::*;
    use crate::telegram::{Telegram, TelegramDecoder};
    use crate::transport::ByteSink;
    use crate::types::SignalValue;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct TestSerial {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        flushes: usize,
    }

    impl TestSerial {
        fn send(&mut self, data: &[u8]) {
            self.rx.extend(data);
        }
    }

    impl ByteSink for TestSerial {
        fn write_all(&mut self, data: &[u8]) {
            self.tx.extend_from_slice(data);
        }

        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    impl SerialPort for TestSerial {
        fn available(&self) -> usize {
            self.rx.len()
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
    }

    #[derive(Clone, Default)]
    struct TestClock(Rc<Cell<u64>>);

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
    }

    fn make_device(config: DeviceConfig) -> (AsiDevice<TestSerial, TestClock>, TestClock) {
        let clock = TestClock::default();
        let mut device = AsiDevice::with_clock(config, TestSerial::default(), clock.clone());
        device.register_short("speed", || 42).unwrap();
        device.register_double("ratio", || 0.25).unwrap();
        (device, clock)
    }

    fn frame(command: ProtocolCommand) -> Vec<u8> {
        command.to_command().encode()
    }

    /// Decode the device output, seeding the decoder with the current symbols.
    fn telegrams(device: &AsiDevice<TestSerial, TestClock>) -> Vec<Telegram> {
        let mut symbols = Vec::new();
        encode_symbols(device.registry(), 0, true, &mut symbols);
        let mut decoder = TelegramDecoder::new();
        decoder.push(&symbols);
        decoder.decode().unwrap().unwrap();

        decoder.push(&device.serial().tx);
        decoder.decode_all().into_iter().map(|t| t.unwrap()).collect()
    }

    #[test]
    fn test_get_signal_list_echoes_and_transmits() {
        let (mut device, _) = make_device(DeviceConfig::default());
        let bytes = frame(ProtocolCommand::GetSignalList { message_id: 0x0102_0304 });
        device.serial_mut().send(&bytes);

        let handled = device.read();
        assert_eq!(handled, Some(ProtocolCommand::GetSignalList { message_id: 0x0102_0304 }));

        let tx = &device.serial().tx;
        assert!(tx.starts_with(&bytes));
        assert_eq!(&tx[bytes.len()..bytes.len() + 2], b"\r\n");
        let decoded = telegrams(&device);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message_id(), 0x0102_0304);
        assert_eq!(decoded[0].len(), 2);
        assert!(device.serial().flushes >= 2);
    }

    #[test]
    fn test_echo_can_be_disabled() {
        let (mut device, _) = make_device(DeviceConfig::default().with_echo(false));
        device.serial_mut().send(&frame(ProtocolCommand::GetData { message_id: 1 }));
        device.read();
        assert!(device.serial().tx.starts_with(TELEGRAM_MAGIC));
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let (mut device, _) = make_device(DeviceConfig::default());
        device.serial_mut().send(b"<LOGGING_GETDATA,1,2>");
        assert_eq!(device.read(), None);
        assert!(device.serial().tx.is_empty());

        // The next well-formed frame is still handled.
        device.serial_mut().send(&frame(ProtocolCommand::Deactivate));
        assert_eq!(device.read(), Some(ProtocolCommand::Deactivate));
    }

    #[test]
    fn test_read_handles_one_frame_per_call() {
        let (mut device, _) = make_device(DeviceConfig::default().with_echo(false));
        let mut bytes = frame(ProtocolCommand::GetData { message_id: 1 });
        bytes.extend(frame(ProtocolCommand::GetData { message_id: 2 }));
        device.serial_mut().send(&bytes);

        assert_eq!(device.read(), Some(ProtocolCommand::GetData { message_id: 1 }));
        assert_eq!(device.read(), Some(ProtocolCommand::GetData { message_id: 2 }));
        assert_eq!(device.read(), None);
        assert_eq!(telegrams(&device).len(), 2);
    }

    #[test]
    fn test_activate_clamps_and_floors() {
        let (mut device, _) = make_device(DeviceConfig::default());
        let mut params = [0; COMMAND_PARAM_COUNT];

        device.serial_mut().send(&Command::new(CMD_ACTIVATE, params).encode());
        device.read();
        assert!(device.scheduler().is_active());
        assert_eq!(device.scheduler().interval_ms(), 100);

        params[0] = 40_000;
        device.serial_mut().send(&Command::new(CMD_ACTIVATE, params).encode());
        device.read();
        assert_eq!(device.scheduler().interval_ms(), 32_767_000);

        device.serial_mut().send(&frame(ProtocolCommand::Deactivate));
        device.read();
        assert!(!device.scheduler().is_active());
        assert_eq!(device.scheduler().interval_ms(), 32_767_000);
    }

    #[test]
    fn test_unknown_command_goes_to_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (device, _) = make_device(DeviceConfig::default());
        let mut device = device.with_handler(move |command: &Command| {
            sink.lock().unwrap().push((command.name.clone(), command.text.clone(), command.params[1]));
        });

        let mut params = [0; COMMAND_PARAM_COUNT - 1];
        params[0] = 7;
        device
            .serial_mut()
            .send(&Command::with_text("SET_NAME", "pump", params).encode());
        device.serial_mut().send(&frame(ProtocolCommand::GetData { message_id: 3 }));
        device.read();
        device.read();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("SET_NAME".to_string(), "pump".to_string(), 7)]
        );
    }

    #[test]
    fn test_tick_fires_data_telegrams() {
        let (mut device, clock) = make_device(DeviceConfig::default().with_echo(false));
        assert!(!device.tick(1));

        device.dispatch(&ProtocolCommand::Activate { interval_s: 1 });
        clock.0.set(500);
        assert!(device.tick(1));
        clock.0.set(1_400);
        assert!(!device.tick(2));
        clock.0.set(1_500);
        assert!(device.tick(3));

        let decoded = telegrams(&device);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].message_id(), 3);
    }

    #[test]
    fn test_initial_logging_settings() {
        let (device, _) = make_device(DeviceConfig::default().with_logging(true, 250));
        assert!(device.scheduler().is_active());
        assert_eq!(device.scheduler().interval_ms(), 250);

        let (mut device, _) = make_device(DeviceConfig::default());
        device.set_logging(false, 5_000);
        assert!(!device.scheduler().is_active());
        assert_eq!(device.scheduler().interval_ms(), 5_000);
    }

    #[test]
    fn test_delete_signals_empties_telegrams() {
        let (mut device, _) = make_device(DeviceConfig::default().with_echo(false));
        device.delete_signals();
        device.transmit_symbols(9);
        let decoded = telegrams(&device);
        assert!(decoded[0].is_empty());
    }

    #[test]
    fn test_subordinate_prefixes_and_responds() {
        let config = DeviceConfig::default().with_mode(DeviceMode::subordinate(5));
        let (device, _) = make_device(config);
        assert_eq!(device.registry().get(0).unwrap().name(), "S5_speed");

        device.on_receive(&[BUS_REQUEST_DATA]);
        let mut response = ResponseBuffer::new();
        device.on_request(&mut response);
        let mut expected = vec![2];
        expected.extend_from_slice(&42i16.to_le_bytes());
        assert_eq!(response.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_controller_without_bus_sends_local_data() {
        let config = DeviceConfig::default()
            .with_mode(DeviceMode::controller(100_000))
            .with_echo(false);
        let (mut device, _) = make_device(config);
        device.transmit_data(4);

        let decoded = telegrams(&device);
        let Telegram::Data { entries, .. } = &decoded[0] else {
            panic!("expected data");
        };
        assert_eq!(entries[0].value, SignalValue::Short(42));
        assert_eq!(entries[1].value, SignalValue::Double(0.25));
        assert!(device.last_report().is_none());
    }

    #[test]
    fn test_message_id_round_trip() {
        let params = message_id_to_params(0xDEAD_BEEF);
        let mut all = [0; COMMAND_PARAM_COUNT];
        all[..4].copy_from_slice(&params);
        let command = ProtocolCommand::from_command(Command::new(CMD_GET_DATA, all));
        assert_eq!(command, ProtocolCommand::GetData { message_id: 0xDEAD_BEEF });
    }
}

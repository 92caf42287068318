//! Shared-bus aggregation.
//!
//! A controller polls subordinate devices on a shared bus and appends their
//! signals to its own telegrams, renumbering them to continue after its local
//! signals. Subordinates answer one signal per response burst and mark
//! structure with in-band sentinels.
//!
//! ```text
//! controller                               subordinate @ addr
//!     |--- probe [0x00] (up to 4 tries) ------->|  phase = symbols, cursor = 0
//!     |<-- 0xAA name 0x00 tag 0x0D -------------|  cursor 0 -> 1
//!     |<-- name 0x00 tag 0x0D ------------------|  cursor 1 -> 2
//!     |<-- name 0x00 tag 0x0D 0x0A -------------|  last signal, end of list
//!
//!     |--- probe [0x01] ----------------------->|  phase = data, cursor = 0
//!     |<-- width value.. -----------------------|
//!     |<-- width value.. 0x7F x 8 --------------|  last signal, end of data
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use asi_metrics::{metric_defs, metrics};

use crate::constants::*;
use crate::error::ProtocolError;
use crate::registry::SignalRegistry;
use crate::telegram::{finish, write_data_entries, write_header, write_symbol_entries, TelegramKind};
use crate::transport::{ByteSink, CountingSink};

// ============================================================================
// Collaborator Interfaces
// ============================================================================

/// Status returned when an addressed transmission ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    /// Acknowledged.
    Success,
    /// Data did not fit the transmit buffer.
    DataTooLong,
    /// No device acknowledged the address.
    AddressNack,
    /// The device rejected a data byte.
    DataNack,
    /// Any other transport error.
    Other(u8),
}

impl TransmitStatus {
    /// Whether the transmission was acknowledged.
    pub fn is_success(self) -> bool {
        self == TransmitStatus::Success
    }
}

impl From<u8> for TransmitStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => TransmitStatus::Success,
            1 => TransmitStatus::DataTooLong,
            2 => TransmitStatus::AddressNack,
            3 => TransmitStatus::DataNack,
            other => TransmitStatus::Other(other),
        }
    }
}

/// Controller-side view of the shared bus.
pub trait BusTransport {
    /// Start an addressed transmission.
    fn begin_transmission(&mut self, address: u8);

    /// Queue bytes for the open transmission.
    fn write(&mut self, data: &[u8]) -> usize;

    /// Send the open transmission and report whether it was acknowledged.
    fn end_transmission(&mut self) -> TransmitStatus;

    /// Request up to `len` bytes from `address`; returns the count received.
    fn request_from(&mut self, address: u8, len: usize) -> usize;

    /// Received bytes not yet read.
    fn available(&self) -> usize;

    /// Read one received byte.
    fn read_byte(&mut self) -> Option<u8>;
}

impl<T: BusTransport + ?Sized> BusTransport for Box<T> {
    fn begin_transmission(&mut self, address: u8) {
        (**self).begin_transmission(address)
    }

    fn write(&mut self, data: &[u8]) -> usize {
        (**self).write(data)
    }

    fn end_transmission(&mut self) -> TransmitStatus {
        (**self).end_transmission()
    }

    fn request_from(&mut self, address: u8, len: usize) -> usize {
        (**self).request_from(address, len)
    }

    fn available(&self) -> usize {
        (**self).available()
    }

    fn read_byte(&mut self) -> Option<u8> {
        (**self).read_byte()
    }
}

/// Subordinate-side callbacks, invoked by the bus transport.
///
/// Both run in interrupt context: they must not block and have nobody to
/// report errors to.
pub trait BusResponder {
    /// The controller finished writing a request.
    fn on_receive(&self, data: &[u8]);

    /// The controller wants a response burst.
    fn on_request(&self, response: &mut ResponseBuffer);
}

impl<T: BusResponder + ?Sized> BusResponder for Arc<T> {
    fn on_receive(&self, data: &[u8]) {
        (**self).on_receive(data)
    }

    fn on_request(&self, response: &mut ResponseBuffer) {
        (**self).on_request(response)
    }
}

/// One response burst. Bytes beyond [`BUS_BURST_SIZE`] are dropped.
#[derive(Debug, Clone)]
pub struct ResponseBuffer {
    buf: [u8; BUS_BURST_SIZE],
    len: usize,
    overflowed: bool,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuffer {
    /// Create an empty burst.
    pub fn new() -> Self {
        ResponseBuffer {
            buf: [0; BUS_BURST_SIZE],
            len: 0,
            overflowed: false,
        }
    }

    /// Append bytes, returning how many fit.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(BUS_BURST_SIZE - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        if n < data.len() {
            self.overflowed = true;
        }
        n
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any write was cut short.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Empty the burst for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
        self.overflowed = false;
    }
}

// ============================================================================
// Subordinate Side
// ============================================================================

/// What the controller asked a subordinate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    /// Symbol list requested (`0x00`).
    Symbols,
    /// Data requested (`0x01`).
    Data,
    /// A request byte this protocol does not define; responses are empty.
    Unknown(u8),
}

impl BusPhase {
    fn from_request(byte: u8) -> Self {
        match byte {
            BUS_REQUEST_SYMBOLS => BusPhase::Symbols,
            BUS_REQUEST_DATA => BusPhase::Data,
            other => BusPhase::Unknown(other),
        }
    }

    fn code(self) -> u8 {
        match self {
            BusPhase::Symbols => BUS_REQUEST_SYMBOLS,
            BusPhase::Data => BUS_REQUEST_DATA,
            BusPhase::Unknown(other) => other,
        }
    }
}

const CURSOR_BITS: u32 = 24;
const CURSOR_MASK: u32 = (1 << CURSOR_BITS) - 1;

/// Requested phase and emission cursor, packed into one atomic word so the
/// pair always changes together.
#[derive(Debug)]
pub struct SubordinateState {
    packed: AtomicU32,
}

impl Default for SubordinateState {
    fn default() -> Self {
        Self::new()
    }
}

impl SubordinateState {
    /// Start in the symbol phase at the first signal.
    pub fn new() -> Self {
        SubordinateState {
            packed: AtomicU32::new(pack(BusPhase::Symbols, 0)),
        }
    }

    /// Record a request: set the phase and rewind the cursor.
    pub fn record_request(&self, request: u8) {
        self.packed
            .store(pack(BusPhase::from_request(request), 0), Ordering::SeqCst);
    }

    /// Current phase and cursor.
    pub fn snapshot(&self) -> (BusPhase, usize) {
        unpack(self.packed.load(Ordering::SeqCst))
    }

    /// Move the cursor from `from` to `to` unless a new request arrived since
    /// `from` was read.
    fn advance(&self, phase: BusPhase, from: usize, to: usize) {
        let _ = self.packed.compare_exchange(
            pack(phase, from),
            pack(phase, to),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

fn pack(phase: BusPhase, cursor: usize) -> u32 {
    ((phase.code() as u32) << CURSOR_BITS) | (cursor as u32 & CURSOR_MASK)
}

fn unpack(word: u32) -> (BusPhase, usize) {
    (
        BusPhase::from_request((word >> CURSOR_BITS) as u8),
        (word & CURSOR_MASK) as usize,
    )
}

/// Fill one response burst for the current phase and advance the cursor.
///
/// Emits exactly one signal per call. After the last signal the list
/// terminator follows in the same burst and the cursor wraps to zero.
pub fn respond(registry: &SignalRegistry, state: &SubordinateState, out: &mut ResponseBuffer) {
    let (phase, cursor) = state.snapshot();
    let count = registry.len();

    match phase {
        BusPhase::Symbols => {
            if cursor == 0 {
                out.write(&[BUS_HANDSHAKE]);
            }
            if count > 0 {
                match registry.get(cursor) {
                    Ok(signal) => {
                        let name = signal.name().as_bytes();
                        out.write(&name[..name.len().min(BUS_MAX_NAME_LEN)]);
                        out.write(&[0x00, signal.signal_type().tag(), BUS_END_OF_SIGNAL]);
                    }
                    Err(e) => {
                        log::warn!("bus symbol response dropped: {}", e);
                        state.advance(phase, cursor, 0);
                        return;
                    }
                }
            }
            let next = cursor + 1;
            if next >= count {
                out.write(&[BUS_END_OF_LIST]);
                state.advance(phase, cursor, 0);
            } else {
                state.advance(phase, cursor, next);
            }
        }
        BusPhase::Data => {
            if count > 0 {
                match registry.get(cursor) {
                    Ok(signal) => {
                        let (buf, width) = signal.read().to_wire();
                        out.write(&[width as u8]);
                        out.write(&buf[..width]);
                    }
                    Err(e) => {
                        log::warn!("bus data response dropped: {}", e);
                        state.advance(phase, cursor, 0);
                        return;
                    }
                }
            }
            let next = cursor + 1;
            if next >= count {
                out.write(&[BUS_END_OF_DATA; BUS_END_OF_DATA_RUN]);
                state.advance(phase, cursor, 0);
            } else {
                state.advance(phase, cursor, next);
            }
        }
        BusPhase::Unknown(request) => {
            log::debug!("bus response requested for unknown phase 0x{:02X}", request);
        }
    }

    if out.overflowed() {
        log::warn!("bus response exceeded {} bytes and was cut", BUS_BURST_SIZE);
    }
}

// ============================================================================
// Controller Side
// ============================================================================

/// Result of relaying one address during an aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOutcome {
    /// No acknowledgement after every probe attempt.
    Absent { attempts: usize },
    /// Acknowledged the probe but did not open with the handshake byte.
    NotAsi,
    /// Acknowledged the probe but sent no usable burst before the cap.
    Silent,
    /// Relayed up to and including the end sentinel.
    Relayed { signals: usize },
    /// Burst cap reached before the end sentinel; output may be truncated.
    Exhausted { signals: usize },
}

/// What an aggregation pass did, per address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    pub kind: TelegramKind,
    /// Signals from the controller's own registry.
    pub local_signals: usize,
    /// Signals relayed from subordinates.
    pub relayed_signals: usize,
    /// Outcome for every probed address, in polling order.
    pub outcomes: Vec<(u8, AddressOutcome)>,
    /// Bytes written to the output channel.
    pub bytes_written: usize,
}

impl AggregationReport {
    fn new(kind: TelegramKind, local_signals: usize) -> Self {
        AggregationReport {
            kind,
            local_signals,
            relayed_signals: 0,
            outcomes: Vec::new(),
            bytes_written: 0,
        }
    }

    /// Addresses that answered with the protocol, in polling order.
    pub fn present(&self) -> Vec<u8> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, AddressOutcome::Relayed { .. } | AddressOutcome::Exhausted { .. }))
            .map(|(a, _)| *a)
            .collect()
    }

    /// Outcome recorded for `address`, if it was probed.
    pub fn outcome(&self, address: u8) -> Option<AddressOutcome> {
        self.outcomes
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, o)| *o)
    }

    /// Per-address failures as errors, for diagnostics.
    pub fn failures(&self) -> Vec<ProtocolError> {
        self.outcomes
            .iter()
            .filter_map(|&(address, outcome)| match outcome {
                AddressOutcome::Absent { attempts } => {
                    Some(ProtocolError::BusProbeFailed { address, attempts })
                }
                AddressOutcome::Exhausted { .. } | AddressOutcome::Silent => {
                    Some(ProtocolError::BusPollExhausted {
                        address,
                        bursts: BUS_MAX_BURSTS,
                    })
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RosterEntry {
    first_index: usize,
    signals: usize,
}

/// Controller-side aggregation state.
///
/// The roster is rebuilt by every symbol pass. Data passes relay only roster
/// members and reuse the index ranges the symbol pass assigned, so data
/// indices line up with the host's symbol list even if an address drops out.
#[derive(Debug)]
pub struct BusAggregator {
    roster: [Option<RosterEntry>; BUS_MAX_ADDRESS as usize + 1],
    roster_valid: bool,
}

impl Default for BusAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl BusAggregator {
    /// Create an aggregator with an empty roster.
    pub fn new() -> Self {
        BusAggregator {
            roster: [None; BUS_MAX_ADDRESS as usize + 1],
            roster_valid: false,
        }
    }

    /// Addresses found by the last symbol pass.
    pub fn roster(&self) -> Vec<u8> {
        (0..=BUS_MAX_ADDRESS)
            .filter(|&a| self.roster[a as usize].is_some())
            .collect()
    }

    /// Whether a symbol pass has populated the roster.
    pub fn roster_valid(&self) -> bool {
        self.roster_valid
    }

    /// Forget the roster; data passes relay nothing until the next symbol pass.
    pub fn invalidate_roster(&mut self) {
        self.roster = [None; BUS_MAX_ADDRESS as usize + 1];
        self.roster_valid = false;
    }

    /// Emit the local symbol list followed by every subordinate's.
    pub fn transmit_symbols<B, S>(
        &mut self,
        registry: &SignalRegistry,
        message_id: u32,
        terminal: bool,
        bus: &mut B,
        sink: &mut S,
    ) -> AggregationReport
    where
        B: BusTransport + ?Sized,
        S: ByteSink + ?Sized,
    {
        let mut out = CountingSink::new(sink);
        write_header(&mut out, TelegramKind::Symbols, message_id);
        write_symbol_entries(registry, &mut out);
        out.flush();

        self.invalidate_roster();
        let mut report = AggregationReport::new(TelegramKind::Symbols, registry.len());
        let mut next_index = registry.len();

        for address in 0..=BUS_MAX_ADDRESS {
            if let Err(attempts) = probe(bus, address, BUS_REQUEST_SYMBOLS) {
                report
                    .outcomes
                    .push((address, AddressOutcome::Absent { attempts }));
                continue;
            }

            let first_index = next_index;
            let outcome = relay_symbols(bus, address, &mut out, &mut next_index);
            match outcome {
                AddressOutcome::Relayed { signals } | AddressOutcome::Exhausted { signals } => {
                    self.roster[address as usize] = Some(RosterEntry {
                        first_index,
                        signals,
                    });
                    report.relayed_signals += signals;
                    log::debug!("bus address {} relayed {} symbols", address, signals);
                }
                AddressOutcome::NotAsi => {
                    log::debug!("bus address {} answered without handshake", address);
                }
                AddressOutcome::Silent | AddressOutcome::Absent { .. } => {}
            }
            record_exhaustion(address, outcome);
            report.outcomes.push((address, outcome));
        }
        self.roster_valid = true;
        metrics::gauge!(metric_defs::BUS_ROSTER_SIZE.name).set(self.roster().len() as f64);

        metrics::counter!(metric_defs::BUS_RELAYED_SIGNALS.name, "kind" => "symbols")
            .increment(report.relayed_signals as u64);
        report.bytes_written = finish(&mut out, TelegramKind::Symbols, terminal);
        report
    }

    /// Emit local data followed by the data of every roster member.
    pub fn transmit_data<B, S>(
        &mut self,
        registry: &SignalRegistry,
        message_id: u32,
        terminal: bool,
        bus: &mut B,
        sink: &mut S,
    ) -> AggregationReport
    where
        B: BusTransport + ?Sized,
        S: ByteSink + ?Sized,
    {
        let mut out = CountingSink::new(sink);
        write_header(&mut out, TelegramKind::Data, message_id);
        write_data_entries(registry, &mut out);
        out.flush();

        let mut report = AggregationReport::new(TelegramKind::Data, registry.len());
        if !self.roster_valid {
            log::warn!("data requested before any symbol pass, relaying local signals only");
        }

        for address in 0..=BUS_MAX_ADDRESS {
            let Some(entry) = self.roster[address as usize] else {
                continue;
            };
            if let Err(attempts) = probe(bus, address, BUS_REQUEST_DATA) {
                log::debug!("roster member {} did not acknowledge data probe", address);
                metrics::counter!(metric_defs::BUS_PROBE_FAILURES.name, "address" => address.to_string())
                    .increment(1);
                report
                    .outcomes
                    .push((address, AddressOutcome::Absent { attempts }));
                continue;
            }

            let mut next_index = entry.first_index;
            let outcome = relay_data(bus, address, &mut out, &mut next_index);
            if let AddressOutcome::Relayed { signals } | AddressOutcome::Exhausted { signals } = outcome {
                if signals != entry.signals {
                    log::warn!(
                        "bus address {} sent {} values for {} symbols",
                        address,
                        signals,
                        entry.signals
                    );
                }
                report.relayed_signals += signals;
            }
            record_exhaustion(address, outcome);
            report.outcomes.push((address, outcome));
        }

        metrics::counter!(metric_defs::BUS_RELAYED_SIGNALS.name, "kind" => "data")
            .increment(report.relayed_signals as u64);
        report.bytes_written = finish(&mut out, TelegramKind::Data, terminal);
        report
    }
}

fn record_exhaustion(address: u8, outcome: AddressOutcome) {
    match outcome {
        AddressOutcome::Exhausted { signals } => log::warn!(
            "bus address {} polled {} bursts without end sentinel ({} signals relayed)",
            address,
            BUS_MAX_BURSTS,
            signals
        ),
        AddressOutcome::Silent => log::warn!(
            "bus address {} acknowledged but stayed silent for {} bursts",
            address,
            BUS_MAX_BURSTS
        ),
        _ => return,
    }
    metrics::counter!(metric_defs::BUS_POLL_EXHAUSTED.name, "address" => address.to_string())
        .increment(1);
}

/// Send a one-byte request, retrying. Returns the attempts made on failure.
fn probe<B: BusTransport + ?Sized>(bus: &mut B, address: u8, request: u8) -> Result<usize, usize> {
    for attempt in 1..=BUS_PROBE_ATTEMPTS {
        bus.begin_transmission(address);
        bus.write(&[request]);
        if bus.end_transmission().is_success() {
            return Ok(attempt);
        }
    }
    Err(BUS_PROBE_ATTEMPTS)
}

fn next_byte<B: BusTransport + ?Sized>(bus: &mut B) -> Option<u8> {
    if bus.available() > 0 {
        bus.read_byte()
    } else {
        None
    }
}

fn drain<B: BusTransport + ?Sized>(bus: &mut B) {
    while next_byte(bus).is_some() {}
}

fn relay_symbols<B, S>(bus: &mut B, address: u8, out: &mut S, next_index: &mut usize) -> AddressOutcome
where
    B: BusTransport + ?Sized,
    S: ByteSink + ?Sized,
{
    let mut handshake_seen = false;
    let mut entry_open = false;
    let mut signals = 0;

    for _ in 0..BUS_MAX_BURSTS {
        if bus.request_from(address, BUS_BURST_SIZE) < BUS_MIN_BURST_LEN {
            drain(bus);
            continue;
        }
        if !handshake_seen {
            if next_byte(bus) != Some(BUS_HANDSHAKE) {
                drain(bus);
                return AddressOutcome::NotAsi;
            }
            handshake_seen = true;
        }

        while let Some(byte) = next_byte(bus) {
            match byte {
                BUS_END_OF_SIGNAL => {
                    if entry_open {
                        entry_open = false;
                        signals += 1;
                        *next_index += 1;
                    }
                }
                BUS_END_OF_LIST => {
                    drain(bus);
                    return AddressOutcome::Relayed { signals };
                }
                _ => {
                    if !entry_open {
                        out.write_all(&(*next_index as u16).to_le_bytes());
                        entry_open = true;
                    }
                    out.write_all(&[byte]);
                }
            }
        }
    }
    if handshake_seen {
        AddressOutcome::Exhausted { signals }
    } else {
        AddressOutcome::Silent
    }
}

fn relay_data<B, S>(bus: &mut B, address: u8, out: &mut S, next_index: &mut usize) -> AddressOutcome
where
    B: BusTransport + ?Sized,
    S: ByteSink + ?Sized,
{
    let mut signals = 0;
    let mut answered = false;
    let mut burst = [0u8; BUS_BURST_SIZE];

    for _ in 0..BUS_MAX_BURSTS {
        if bus.request_from(address, BUS_BURST_SIZE) < BUS_MIN_BURST_LEN {
            drain(bus);
            continue;
        }
        let mut len = 0;
        while let Some(byte) = next_byte(bus) {
            if len < BUS_BURST_SIZE {
                burst[len] = byte;
                len += 1;
            }
        }
        if len == 0 {
            continue;
        }
        answered = true;
        let burst = &burst[..len];

        // A subordinate without signals answers with the end sentinel alone.
        if has_end_of_data(burst) && burst[0] == BUS_END_OF_DATA {
            return AddressOutcome::Relayed { signals };
        }

        let width = burst[0] as usize;
        if width == 0 || width > 8 || 1 + width > burst.len() {
            log::debug!("bus address {} sent a malformed data burst", address);
            continue;
        }
        out.write_all(&(*next_index as u16).to_le_bytes());
        out.write_all(&burst[1..1 + width]);
        signals += 1;
        *next_index += 1;

        if has_end_of_data(&burst[1 + width..]) {
            return AddressOutcome::Relayed { signals };
        }
    }
    if answered {
        AddressOutcome::Exhausted { signals }
    } else {
        AddressOutcome::Silent
    }
}

/// Whether `bytes` contains a run of [`BUS_END_OF_DATA_RUN`] sentinel bytes.
fn has_end_of_data(bytes: &[u8]) -> bool {
    let mut run = 0;
    for &b in bytes {
        if b == BUS_END_OF_DATA {
            run += 1;
            if run >= BUS_END_OF_DATA_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SignalBinding;
    use crate::telegram::{Telegram, TelegramDecoder};
    use crate::types::{SignalType, SignalValue};
    use std::collections::{BTreeMap, HashMap, VecDeque};

    enum Device {
        Asi(SignalRegistry, SubordinateState),
        /// Acknowledges probes and answers every request with fixed bytes.
        Raw(Vec<u8>),
    }

    impl TestBus {
        fn requests(&self) -> usize {
            self.requests.values().sum()
        }
    }

    #[derive(Default)]
    struct TestBus {
        devices: BTreeMap<u8, Device>,
        offline: Vec<u8>,
        probes: HashMap<u8, usize>,
        requests: HashMap<u8, usize>,
        target: u8,
        pending: Vec<u8>,
        rx: VecDeque<u8>,
    }

    impl TestBus {
        fn attach(&mut self, address: u8, registry: SignalRegistry) {
            self.devices
                .insert(address, Device::Asi(registry, SubordinateState::new()));
        }
    }

    impl BusTransport for TestBus {
        fn begin_transmission(&mut self, address: u8) {
            self.target = address;
            self.pending.clear();
        }

        fn write(&mut self, data: &[u8]) -> usize {
            self.pending.extend_from_slice(data);
            data.len()
        }

        fn end_transmission(&mut self) -> TransmitStatus {
            *self.probes.entry(self.target).or_default() += 1;
            if self.offline.contains(&self.target) {
                return TransmitStatus::AddressNack;
            }
            match self.devices.get(&self.target) {
                Some(Device::Asi(_, state)) => {
                    state.record_request(self.pending[0]);
                    TransmitStatus::Success
                }
                Some(Device::Raw(_)) => TransmitStatus::Success,
                None => TransmitStatus::AddressNack,
            }
        }

        fn request_from(&mut self, address: u8, len: usize) -> usize {
            *self.requests.entry(address).or_default() += 1;
            let mut response = ResponseBuffer::new();
            match self.devices.get(&address) {
                Some(Device::Asi(registry, state)) => respond(registry, state, &mut response),
                Some(Device::Raw(bytes)) => {
                    response.write(bytes);
                }
                None => {}
            }
            let n = response.len().min(len);
            self.rx.extend(&response.as_slice()[..n]);
            n
        }

        fn available(&self) -> usize {
            self.rx.len()
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }
    }

    fn subordinate(address: u8, names: &[&str]) -> SignalRegistry {
        let mut registry = SignalRegistry::new(8).with_name_prefix(format!("S{}_", address));
        for (i, name) in names.iter().enumerate() {
            let value = (address as i16) * 100 + i as i16;
            registry.register(name, SignalBinding::short(move || value)).unwrap();
        }
        registry
    }

    fn controller() -> SignalRegistry {
        let mut registry = SignalRegistry::new(8);
        registry.register("local", SignalBinding::float(|| 1.5)).unwrap();
        registry
    }

    fn decode_one(bytes: &[u8], decoder: &mut TelegramDecoder) -> Telegram {
        decoder.push(bytes);
        decoder.decode().unwrap().unwrap()
    }

    #[test]
    fn test_transmit_status_codes() {
        assert_eq!(TransmitStatus::from(0), TransmitStatus::Success);
        assert_eq!(TransmitStatus::from(2), TransmitStatus::AddressNack);
        assert_eq!(TransmitStatus::from(3), TransmitStatus::DataNack);
        assert_eq!(TransmitStatus::from(9), TransmitStatus::Other(9));
        assert!(!TransmitStatus::from(4).is_success());
    }

    #[test]
    fn test_response_buffer_caps_at_burst_size() {
        let mut response = ResponseBuffer::new();
        assert_eq!(response.write(&[1; 30]), 30);
        assert_eq!(response.write(&[2; 5]), 2);
        assert_eq!(response.len(), BUS_BURST_SIZE);
        assert!(response.overflowed());

        response.clear();
        assert!(response.is_empty());
        assert!(!response.overflowed());
    }

    #[test]
    fn test_respond_symbols_one_signal_per_burst() {
        let registry = subordinate(5, &["a", "b"]);
        let state = SubordinateState::new();
        state.record_request(BUS_REQUEST_SYMBOLS);

        let mut first = ResponseBuffer::new();
        respond(&registry, &state, &mut first);
        assert_eq!(first.as_slice(), b"\xAAS5_a\x00\x02\x0D");
        assert_eq!(state.snapshot(), (BusPhase::Symbols, 1));

        let mut second = ResponseBuffer::new();
        respond(&registry, &state, &mut second);
        assert_eq!(second.as_slice(), b"S5_b\x00\x02\x0D\x0A");
        assert_eq!(state.snapshot(), (BusPhase::Symbols, 0));
    }

    #[test]
    fn test_respond_data_ends_with_sentinel_run() {
        let registry = subordinate(5, &["a"]);
        let state = SubordinateState::new();
        state.record_request(BUS_REQUEST_DATA);

        let mut response = ResponseBuffer::new();
        respond(&registry, &state, &mut response);
        let mut expected = vec![2];
        expected.extend_from_slice(&500i16.to_le_bytes());
        expected.extend_from_slice(&[BUS_END_OF_DATA; BUS_END_OF_DATA_RUN]);
        assert_eq!(response.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_respond_without_signals() {
        let registry = SignalRegistry::new(4);
        let state = SubordinateState::new();

        state.record_request(BUS_REQUEST_SYMBOLS);
        let mut response = ResponseBuffer::new();
        respond(&registry, &state, &mut response);
        assert_eq!(response.as_slice(), &[BUS_HANDSHAKE, BUS_END_OF_LIST]);

        state.record_request(BUS_REQUEST_DATA);
        let mut response = ResponseBuffer::new();
        respond(&registry, &state, &mut response);
        assert_eq!(response.as_slice(), &[BUS_END_OF_DATA; BUS_END_OF_DATA_RUN]);
    }

    #[test]
    fn test_respond_truncates_long_names() {
        let mut registry = SignalRegistry::new(1);
        registry
            .register(&"x".repeat(40), SignalBinding::bool(|| true))
            .unwrap();
        let state = SubordinateState::new();

        let mut response = ResponseBuffer::new();
        respond(&registry, &state, &mut response);
        assert!(!response.overflowed());
        assert_eq!(response.len(), 1 + BUS_MAX_NAME_LEN + 3 + 1);
    }

    #[test]
    fn test_new_request_wins_over_stale_advance() {
        let state = SubordinateState::new();
        state.record_request(BUS_REQUEST_SYMBOLS);
        state.advance(BusPhase::Symbols, 0, 3);
        assert_eq!(state.snapshot(), (BusPhase::Symbols, 3));

        let (phase, cursor) = state.snapshot();
        state.record_request(BUS_REQUEST_DATA);
        state.advance(phase, cursor, cursor + 1);
        assert_eq!(state.snapshot(), (BusPhase::Data, 0));
    }

    #[test]
    fn test_unknown_request_gives_empty_response() {
        let registry = subordinate(5, &["a"]);
        let state = SubordinateState::new();
        state.record_request(0x42);

        let mut response = ResponseBuffer::new();
        respond(&registry, &state, &mut response);
        assert!(response.is_empty());
        assert_eq!(state.snapshot(), (BusPhase::Unknown(0x42), 0));
    }

    #[test]
    fn test_symbol_pass_renumbers_subordinates() {
        let mut bus = TestBus::default();
        bus.attach(2, subordinate(2, &["a", "b"]));
        bus.attach(5, subordinate(5, &["c"]));
        let registry = controller();
        let mut aggregator = BusAggregator::new();
        let mut out = Vec::new();

        let report = aggregator.transmit_symbols(&registry, 7, true, &mut bus, &mut out);
        assert_eq!(report.local_signals, 1);
        assert_eq!(report.relayed_signals, 3);
        assert_eq!(report.present(), vec![2, 5]);
        assert_eq!(report.bytes_written, out.len());
        assert_eq!(aggregator.roster(), vec![2, 5]);
        assert!(aggregator.roster_valid());

        let telegram = decode_one(&out, &mut TelegramDecoder::new());
        let Telegram::Symbols { message_id, entries } = telegram else {
            panic!("expected symbols");
        };
        assert_eq!(message_id, 7);
        let names: Vec<_> = entries.iter().map(|e| (e.index, e.name.as_str())).collect();
        assert_eq!(names, vec![(0, "local"), (1, "S2_a"), (2, "S2_b"), (3, "S5_c")]);
        assert_eq!(entries[3].signal_type, SignalType::Short);
    }

    #[test]
    fn test_absent_address_probed_four_times() {
        let mut bus = TestBus::default();
        bus.attach(2, subordinate(2, &["a"]));
        let mut aggregator = BusAggregator::new();

        let report = aggregator.transmit_symbols(&controller(), 1, true, &mut bus, &mut Vec::new());
        assert_eq!(bus.probes[&3], BUS_PROBE_ATTEMPTS);
        assert_eq!(bus.probes[&2], 1);
        assert_eq!(
            report.outcome(3),
            Some(AddressOutcome::Absent {
                attempts: BUS_PROBE_ATTEMPTS
            })
        );
        assert_eq!(report.outcomes.len(), BUS_MAX_ADDRESS as usize + 1);
    }

    #[test]
    fn test_data_pass_follows_roster() {
        let mut bus = TestBus::default();
        bus.attach(2, subordinate(2, &["a", "b"]));
        bus.attach(5, subordinate(5, &["c"]));
        let registry = controller();
        let mut aggregator = BusAggregator::new();
        let mut decoder = TelegramDecoder::new();

        let mut symbols = Vec::new();
        aggregator.transmit_symbols(&registry, 1, true, &mut bus, &mut symbols);
        decode_one(&symbols, &mut decoder);

        bus.probes.clear();
        let mut data = Vec::new();
        let report = aggregator.transmit_data(&registry, 2, true, &mut bus, &mut data);
        assert_eq!(report.relayed_signals, 3);
        // Only roster members are probed during a data pass.
        assert_eq!(bus.probes.len(), 2);

        let Telegram::Data { entries, .. } = decode_one(&data, &mut decoder) else {
            panic!("expected data");
        };
        let values: Vec<_> = entries.iter().map(|e| (e.index, e.value)).collect();
        assert_eq!(
            values,
            vec![
                (0, SignalValue::Float(1.5)),
                (1, SignalValue::Short(200)),
                (2, SignalValue::Short(201)),
                (3, SignalValue::Short(500)),
            ]
        );
    }

    #[test]
    fn test_dropped_subordinate_keeps_indices() {
        let mut bus = TestBus::default();
        bus.attach(2, subordinate(2, &["a", "b"]));
        bus.attach(5, subordinate(5, &["c"]));
        let registry = controller();
        let mut aggregator = BusAggregator::new();
        let mut decoder = TelegramDecoder::new();

        let mut symbols = Vec::new();
        aggregator.transmit_symbols(&registry, 1, true, &mut bus, &mut symbols);
        decode_one(&symbols, &mut decoder);

        bus.offline.push(2);
        let mut data = Vec::new();
        let report = aggregator.transmit_data(&registry, 2, true, &mut bus, &mut data);
        assert_eq!(
            report.failures(),
            vec![ProtocolError::BusProbeFailed {
                address: 2,
                attempts: BUS_PROBE_ATTEMPTS
            }]
        );

        let Telegram::Data { entries, .. } = decode_one(&data, &mut decoder) else {
            panic!("expected data");
        };
        let indices: Vec<_> = entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 3]);
    }

    #[test]
    fn test_data_before_symbols_is_local_only() {
        let mut bus = TestBus::default();
        bus.attach(2, subordinate(2, &["a"]));
        let mut aggregator = BusAggregator::new();

        let mut data = Vec::new();
        let report = aggregator.transmit_data(&controller(), 1, true, &mut bus, &mut data);
        assert_eq!(report.relayed_signals, 0);
        assert!(report.outcomes.is_empty());
        assert!(bus.probes.is_empty());
        assert!(data.ends_with(TELEGRAM_TRAILER));
    }

    #[test]
    fn test_device_without_handshake_is_skipped() {
        let mut bus = TestBus::default();
        bus.devices.insert(9, Device::Raw(b"hello".to_vec()));
        let mut aggregator = BusAggregator::new();

        let report = aggregator.transmit_symbols(&controller(), 1, true, &mut bus, &mut Vec::new());
        assert_eq!(report.outcome(9), Some(AddressOutcome::NotAsi));
        assert!(aggregator.roster().is_empty());
    }

    #[test]
    fn test_endless_subordinate_hits_burst_cap() {
        let mut bus = TestBus::default();
        // Handshake on every burst, never a list terminator.
        bus.devices.insert(4, Device::Raw(vec![BUS_HANDSHAKE, b'z']));
        let mut aggregator = BusAggregator::new();

        let report = aggregator.transmit_symbols(&controller(), 1, false, &mut bus, &mut Vec::new());
        assert!(matches!(
            report.outcome(4),
            Some(AddressOutcome::Exhausted { .. })
        ));
        assert!(report.failures().contains(&ProtocolError::BusPollExhausted {
            address: 4,
            bursts: BUS_MAX_BURSTS
        }));
    }

    #[test]
    fn test_silent_device_stays_off_roster() {
        let mut bus = TestBus::default();
        bus.devices.insert(6, Device::Raw(Vec::new()));
        let registry = controller();
        let mut aggregator = BusAggregator::new();

        let report = aggregator.transmit_symbols(&registry, 1, true, &mut bus, &mut Vec::new());
        assert_eq!(report.outcome(6), Some(AddressOutcome::Silent));
        assert!(report.present().is_empty());
        assert!(aggregator.roster().is_empty());
        assert_eq!(bus.requests[&6], BUS_MAX_BURSTS);

        bus.requests.clear();
        let report = aggregator.transmit_data(&registry, 2, true, &mut bus, &mut Vec::new());
        assert!(report.outcomes.is_empty());
        assert_eq!(bus.requests(), 0);
    }

    #[test]
    fn test_endless_data_hits_burst_cap() {
        let mut bus = TestBus::default();
        bus.attach(3, subordinate(3, &["a"]));
        let registry = controller();
        let mut aggregator = BusAggregator::new();
        aggregator.transmit_symbols(&registry, 1, true, &mut bus, &mut Vec::new());
        assert_eq!(aggregator.roster(), vec![3]);

        // Same address now streams values without the end-of-data run.
        bus.devices.insert(3, Device::Raw(vec![1, 0x05]));
        bus.requests.clear();
        let mut data = Vec::new();
        let report = aggregator.transmit_data(&registry, 2, true, &mut bus, &mut data);
        assert_eq!(
            report.outcome(3),
            Some(AddressOutcome::Exhausted {
                signals: BUS_MAX_BURSTS
            })
        );
        assert_eq!(bus.requests[&3], BUS_MAX_BURSTS);
        assert!(report.failures().contains(&ProtocolError::BusPollExhausted {
            address: 3,
            bursts: BUS_MAX_BURSTS
        }));
        assert!(data.ends_with(TELEGRAM_TRAILER));
    }

    #[test]
    fn test_roster_member_gone_quiet_is_silent() {
        let mut bus = TestBus::default();
        bus.attach(3, subordinate(3, &["a"]));
        let registry = controller();
        let mut aggregator = BusAggregator::new();
        aggregator.transmit_symbols(&registry, 1, true, &mut bus, &mut Vec::new());

        bus.devices.insert(3, Device::Raw(Vec::new()));
        let report = aggregator.transmit_data(&registry, 2, true, &mut bus, &mut Vec::new());
        assert_eq!(report.outcome(3), Some(AddressOutcome::Silent));
        assert_eq!(report.relayed_signals, 0);
    }

    #[test]
    fn test_end_of_data_detection() {
        assert!(has_end_of_data(&[BUS_END_OF_DATA; 8]));
        assert!(has_end_of_data(&[1, 2, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F]));
        assert!(!has_end_of_data(&[0x7F; 7]));
        assert!(!has_end_of_data(&[0x7F, 0x7F, 0x7F, 0x7F, 0, 0x7F, 0x7F, 0x7F, 0x7F]));
    }
}

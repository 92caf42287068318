//! Simulated shared bus.
//!
//! Subordinates are attached as [`BusResponder`]s at an address. A write to
//! an attached address is acknowledged and delivered through
//! [`BusResponder::on_receive`]; a read request collects one response burst
//! through [`BusResponder::on_request`]. Unattached addresses never
//! acknowledge.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use asi_protocol::{BusResponder, BusTransport, ResponseBuffer, TransmitStatus};
use parking_lot::Mutex;
use tracing::trace;

type Responder = Arc<dyn BusResponder + Send + Sync>;

#[derive(Default)]
struct BusState {
    responders: BTreeMap<u8, Responder>,
    /// Attached addresses forced to ignore their address.
    offline: HashSet<u8>,
    probe_attempts: HashMap<u8, usize>,
    requests: HashMap<u8, usize>,
    target: Option<u8>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
}

/// A shared bus with attachable subordinates. Clones share the same bus.
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl std::fmt::Debug for SimBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimBus")
            .field("addresses", &state.responders.keys().collect::<Vec<_>>())
            .field("offline", &state.offline)
            .finish()
    }
}

impl SimBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a responder at `address`, replacing any previous one.
    pub fn attach(&self, address: u8, responder: Responder) {
        self.state.lock().responders.insert(address, responder);
    }

    /// Addresses with an attached responder.
    pub fn addresses(&self) -> Vec<u8> {
        self.state.lock().responders.keys().copied().collect()
    }

    /// Make an attached address stop (or resume) acknowledging.
    pub fn set_offline(&self, address: u8, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(address);
        } else {
            state.offline.remove(&address);
        }
    }

    /// Transmissions ended towards `address`, acknowledged or not.
    pub fn probe_attempts(&self, address: u8) -> usize {
        self.state
            .lock()
            .probe_attempts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Read requests served by `address`.
    pub fn requests(&self, address: u8) -> usize {
        self.state.lock().requests.get(&address).copied().unwrap_or(0)
    }

    /// Zero the probe and request counters.
    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.probe_attempts.clear();
        state.requests.clear();
    }

    fn responder(&self, address: u8) -> Option<Responder> {
        let state = self.state.lock();
        if state.offline.contains(&address) {
            return None;
        }
        state.responders.get(&address).cloned()
    }
}

impl BusTransport for SimBus {
    fn begin_transmission(&mut self, address: u8) {
        let mut state = self.state.lock();
        state.target = Some(address);
        state.pending.clear();
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.state.lock().pending.extend_from_slice(data);
        data.len()
    }

    fn end_transmission(&mut self) -> TransmitStatus {
        let (address, pending) = {
            let mut state = self.state.lock();
            let Some(address) = state.target.take() else {
                return TransmitStatus::Other(4);
            };
            *state.probe_attempts.entry(address).or_default() += 1;
            (address, std::mem::take(&mut state.pending))
        };

        // Responders run without the bus lock held.
        match self.responder(address) {
            Some(responder) => {
                responder.on_receive(&pending);
                trace!(address, bytes = pending.len(), "bus write acknowledged");
                TransmitStatus::Success
            }
            None => TransmitStatus::AddressNack,
        }
    }

    fn request_from(&mut self, address: u8, len: usize) -> usize {
        let Some(responder) = self.responder(address) else {
            return 0;
        };
        let mut response = ResponseBuffer::new();
        responder.on_request(&mut response);

        let n = response.len().min(len);
        let mut state = self.state.lock();
        *state.requests.entry(address).or_default() += 1;
        state.rx.extend(&response.as_slice()[..n]);
        n
    }

    fn available(&self) -> usize {
        self.state.lock().rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.state.lock().rx.pop_front()
    }
}

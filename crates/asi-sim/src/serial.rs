//! In-memory serial port.

use std::collections::VecDeque;
use std::sync::Arc;

use asi_protocol::{ByteSink, SerialPort};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct SerialBuffers {
    /// Host → device.
    rx: VecDeque<u8>,
    /// Device → host.
    tx: Vec<u8>,
    flushes: usize,
}

/// A serial port backed by two in-memory queues.
///
/// Clones share the same queues: the device owns one handle and the host side
/// of the harness keeps another.
#[derive(Debug, Clone, Default)]
pub struct MemorySerial {
    inner: Arc<Mutex<SerialBuffers>>,
}

impl MemorySerial {
    /// Create a port with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to read.
    pub fn send(&self, data: &[u8]) {
        self.inner.lock().rx.extend(data);
    }

    /// Take everything the device has written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().tx)
    }

    /// Bytes written by the device and not yet taken.
    pub fn output_len(&self) -> usize {
        self.inner.lock().tx.len()
    }

    /// Bytes queued for the device and not yet read.
    pub fn pending_input(&self) -> usize {
        self.inner.lock().rx.len()
    }

    /// Number of flushes the device has issued.
    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }
}

impl ByteSink for MemorySerial {
    fn write_all(&mut self, data: &[u8]) {
        self.inner.lock().tx.extend_from_slice(data);
    }

    fn flush(&mut self) {
        self.inner.lock().flushes += 1;
    }
}

impl SerialPort for MemorySerial {
    fn available(&self) -> usize {
        self.inner.lock().rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inner.lock().rx.pop_front()
    }
}

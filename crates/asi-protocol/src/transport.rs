//! Serial channel and clock collaborators.
//!
//! The physical port is outside the protocol core. It is reached through
//! [`SerialPort`], whose writes are blocking: [`ByteSink::flush`] returns only
//! once everything written has been physically sent.

use std::time::Instant;

use bytes::BytesMut;

/// Destination for telegram bytes.
pub trait ByteSink {
    /// Queue bytes for transmission.
    fn write_all(&mut self, data: &[u8]);

    /// Block until every queued byte has been sent.
    fn flush(&mut self);
}

/// A bidirectional byte-stream transport.
pub trait SerialPort: ByteSink {
    /// Number of received bytes ready to read.
    fn available(&self) -> usize;

    /// Read one received byte.
    fn read_byte(&mut self) -> Option<u8>;
}

impl ByteSink for Vec<u8> {
    fn write_all(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }

    fn flush(&mut self) {}
}

impl ByteSink for BytesMut {
    fn write_all(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }

    fn flush(&mut self) {}
}

impl<T: ByteSink + ?Sized> ByteSink for &mut T {
    fn write_all(&mut self, data: &[u8]) {
        (**self).write_all(data);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

/// Byte sink that counts what passes through it.
pub(crate) struct CountingSink<'a, S: ByteSink + ?Sized> {
    inner: &'a mut S,
    pub(crate) written: usize,
}

impl<'a, S: ByteSink + ?Sized> CountingSink<'a, S> {
    pub(crate) fn new(inner: &'a mut S) -> Self {
        CountingSink { inner, written: 0 }
    }
}

impl<S: ByteSink + ?Sized> ByteSink for CountingSink<'_, S> {
    fn write_all(&mut self, data: &[u8]) {
        self.written += data.len();
        self.inner.write_all(data);
    }

    fn flush(&mut self) {
        self.inner.flush();
    }
}

/// A monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Clock backed by [`Instant`], counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock reading zero now.
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

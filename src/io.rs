//! Interfaces the device consumes from its host: a byte stream standing in
//! for the RS-485 driver and a monotonic clock.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Non-blocking, byte-at-a-time serial line.
pub trait ByteStream {
    type Error: core::fmt::Debug;

    fn read(&mut self) -> nb::Result<u8, Self::Error>;
    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error>;

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

pub trait MonotonicClock {
    fn now_us(&self) -> u64;

    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

impl<T: MonotonicClock + ?Sized> MonotonicClock for &T {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// Wall-clock time since construction.
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for StdClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Clock advanced explicitly, for simulated time.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }

    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::Relaxed);
    }
}

impl MonotonicClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Relaxed)
    }
}

/// In-memory line: bytes fed in are read by the device, bytes it writes
/// collect on the output side.
#[derive(Debug, Default)]
pub struct MemoryStream {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    tx_limit: Option<usize>,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse writes with `WouldBlock` once `limit` bytes are waiting.
    pub fn with_tx_limit(limit: usize) -> Self {
        Self {
            tx_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    pub fn pending_input(&self) -> usize {
        self.rx.len()
    }
}

impl ByteStream for MemoryStream {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error> {
        if self.tx_limit.is_some_and(|limit| self.tx.len() >= limit) {
            return Err(nb::Error::WouldBlock);
        }
        self.tx.push(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stream_would_block_when_empty() {
        let mut stream = MemoryStream::new();
        assert!(matches!(stream.read(), Err(nb::Error::WouldBlock)));
        stream.feed(&[1, 2]);
        assert_eq!(stream.read(), Ok(1));
        assert_eq!(stream.pending_input(), 1);
    }

    #[test]
    fn test_memory_stream_tx_limit() {
        let mut stream = MemoryStream::with_tx_limit(1);
        assert!(stream.write(0xAA).is_ok());
        assert!(matches!(stream.write(0xBB), Err(nb::Error::WouldBlock)));
        assert_eq!(stream.take_output(), vec![0xAA]);
        assert!(stream.write(0xBB).is_ok());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        clock.advance_ms(3);
        clock.advance_us(500);
        assert_eq!(clock.now_us(), 3_500);
        assert_eq!(clock.now_ms(), 3);
    }
}

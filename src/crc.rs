//! CRC-16/CCITT as carried by NSP: polynomial 0x1021 processed LSB-first
//! (reversed 0x8408), initial value 0xFFFF, no final XOR, transmitted
//! little-endian after the covered bytes.

use tracing::debug;

pub const CRC_INIT: u16 = 0xFFFF;
pub const CRC_POLY_REVERSED: u16 = 0x8408;
pub const CRC_LEN: usize = 2;

/// XOR mask applied to an outgoing CRC while a corruption is pending.
const CORRUPTION_MASK: u16 = 0xFFFF;

#[must_use]
pub const fn init() -> u16 {
    CRC_INIT
}

/// Fold `bytes` into a running CRC. Calls may be chained to cover a
/// message delivered in pieces.
#[must_use]
pub fn update(mut crc: u16, bytes: &[u8]) -> u16 {
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY_REVERSED;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[must_use]
pub fn calculate(bytes: &[u8]) -> u16 {
    update(init(), bytes)
}

/// Check a packet whose last two bytes are its CRC (LSB first).
#[must_use]
pub fn verify(packet: &[u8]) -> bool {
    if packet.len() < CRC_LEN {
        return false;
    }
    let (data, tail) = packet.split_at(packet.len() - CRC_LEN);
    calculate(data) == u16::from_le_bytes([tail[0], tail[1]])
}

/// Write the CRC of `buffer[..data_len]` at `data_len` and `data_len + 1`.
///
/// Returns the new length, or `None` when the buffer has no room for the
/// two CRC bytes.
#[must_use]
pub fn append(buffer: &mut [u8], data_len: usize) -> Option<usize> {
    append_with(buffer, data_len, 0)
}

fn append_with(buffer: &mut [u8], data_len: usize, xor: u16) -> Option<usize> {
    let end = data_len.checked_add(CRC_LEN)?;
    if end > buffer.len() {
        return None;
    }
    let crc = calculate(&buffer[..data_len]) ^ xor;
    buffer[data_len..end].copy_from_slice(&crc.to_le_bytes());
    Some(end)
}

/// Stateful front-end to the CRC functions used on the transmit path.
///
/// Holds the corruption hook: while `pending_corruptions > 0`, every
/// `append` writes a deliberately wrong CRC and decrements the count.
#[derive(Debug, Default)]
pub struct CrcEngine {
    pending_corruptions: u32,
    corrupted_total: u32,
}

impl CrcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, buffer: &mut [u8], data_len: usize) -> Option<usize> {
        let xor = if self.corruption_pending() {
            CORRUPTION_MASK
        } else {
            0
        };
        let len = append_with(buffer, data_len, xor)?;
        if xor != 0 {
            self.pending_corruptions -= 1;
            self.corrupted_total = self.corrupted_total.wrapping_add(1);
            debug!(remaining = self.pending_corruptions, "outgoing CRC corrupted");
        }
        Some(len)
    }

    pub fn verify(&self, packet: &[u8]) -> bool {
        verify(packet)
    }

    pub fn corruption_pending(&self) -> bool {
        self.pending_corruptions > 0
    }

    pub fn corrupt_next(&mut self, count: u32) {
        self.pending_corruptions = self.pending_corruptions.saturating_add(count);
    }

    pub fn pending_corruptions(&self) -> u32 {
        self.pending_corruptions
    }

    pub fn corrupted_total(&self) -> u32 {
        self.corrupted_total
    }

    /// Drop any pending corruption.
    pub fn restore(&mut self) {
        self.pending_corruptions = 0;
    }
}

//! SLIP framing (RFC 1055) as used on the RS-485 line.
//!
//! Outgoing frames carry END on both ends; the decoder ignores empty frames
//! so either delimiter convention is accepted on receive.

use heapless::Vec;
use thiserror::Error;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Largest decoded frame accepted from the line.
pub const MAX_FRAME_LEN: usize = 512;
/// Worst case: every byte escaped, plus both delimiters.
pub const MAX_ENCODED_LEN: usize = MAX_FRAME_LEN * 2 + 2;

pub type Frame = Vec<u8, MAX_FRAME_LEN>;
pub type EncodedFrame = Vec<u8, MAX_ENCODED_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlipError {
    #[error("invalid escape sequence 0xDB 0x{0:02X}")]
    InvalidEscape(u8),
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
    #[error("output buffer too small")]
    BufferTooSmall,
}

/// Escape `payload` into `out`, wrapped in END delimiters.
pub fn encode_into(payload: &[u8], out: &mut [u8]) -> Result<usize, SlipError> {
    let mut idx = 0;
    let mut put = |byte: u8| -> Result<(), SlipError> {
        let slot = out.get_mut(idx).ok_or(SlipError::BufferTooSmall)?;
        *slot = byte;
        idx += 1;
        Ok(())
    };

    put(SLIP_END)?;
    for &byte in payload {
        match byte {
            SLIP_END => {
                put(SLIP_ESC)?;
                put(SLIP_ESC_END)?;
            }
            SLIP_ESC => {
                put(SLIP_ESC)?;
                put(SLIP_ESC_ESC)?;
            }
            other => put(other)?,
        }
    }
    put(SLIP_END)?;
    Ok(idx)
}

pub fn encode(payload: &[u8]) -> Result<EncodedFrame, SlipError> {
    let mut scratch = [0u8; MAX_ENCODED_LEN];
    let len = encode_into(payload, &mut scratch)?;
    Vec::from_slice(&scratch[..len]).map_err(|()| SlipError::BufferTooSmall)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Normal,
    Escaped,
}

/// Byte-at-a-time SLIP decoder.
///
/// After an error the partial frame is discarded and the remaining bytes up
/// to the next END are skipped, so one bad frame never leaks into the next.
#[derive(Debug)]
pub struct SlipDecoder<const N: usize> {
    buffer: Vec<u8, N>,
    state: DecodeState,
    discarding: bool,
}

impl<const N: usize> SlipDecoder<N> {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::Normal,
            discarding: false,
        }
    }

    /// Feed one byte. Returns a complete frame when `byte` terminates one.
    pub fn push(&mut self, byte: u8) -> Result<Option<Vec<u8, N>>, SlipError> {
        if byte == SLIP_END {
            let discarded = self.discarding;
            self.state = DecodeState::Normal;
            self.discarding = false;
            if discarded || self.buffer.is_empty() {
                self.buffer.clear();
                return Ok(None);
            }
            return Ok(Some(core::mem::take(&mut self.buffer)));
        }

        if self.discarding {
            return Ok(None);
        }

        let decoded = match self.state {
            DecodeState::Escaped => {
                self.state = DecodeState::Normal;
                match byte {
                    SLIP_ESC_END => SLIP_END,
                    SLIP_ESC_ESC => SLIP_ESC,
                    other => return Err(self.abort(SlipError::InvalidEscape(other))),
                }
            }
            DecodeState::Normal if byte == SLIP_ESC => {
                self.state = DecodeState::Escaped;
                return Ok(None);
            }
            DecodeState::Normal => byte,
        };

        if self.buffer.push(decoded).is_err() {
            return Err(self.abort(SlipError::FrameTooLarge));
        }
        Ok(None)
    }

    fn abort(&mut self, error: SlipError) -> SlipError {
        self.buffer.clear();
        self.state = DecodeState::Normal;
        self.discarding = true;
        error
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::Normal;
        self.discarding = false;
    }

    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.state == DecodeState::Normal && !self.discarding
    }
}

impl<const N: usize> Default for SlipDecoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the transmit path should do with the next outgoing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Send,
    Drop,
    Duplicate,
    Delay { delay_ms: u32 },
}

/// Injection hook consulted once per outgoing frame.
///
/// Each perturbation is counted down as frames pass; drop wins over
/// duplicate, duplicate over delay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameHook {
    drop: u32,
    duplicate: u32,
    delay: u32,
    delay_ms: u32,
}

impl FrameHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drop_next(&mut self, count: u32) {
        self.drop = self.drop.saturating_add(count);
    }

    pub fn duplicate_next(&mut self, count: u32) {
        self.duplicate = self.duplicate.saturating_add(count);
    }

    pub fn delay_next(&mut self, count: u32, delay_ms: u32) {
        self.delay = self.delay.saturating_add(count);
        self.delay_ms = delay_ms;
    }

    pub fn next_action(&mut self) -> FrameAction {
        if self.drop > 0 {
            self.drop -= 1;
            FrameAction::Drop
        } else if self.duplicate > 0 {
            self.duplicate -= 1;
            FrameAction::Duplicate
        } else if self.delay > 0 {
            self.delay -= 1;
            FrameAction::Delay {
                delay_ms: self.delay_ms,
            }
        } else {
            FrameAction::Send
        }
    }

    pub fn is_active(&self) -> bool {
        self.drop > 0 || self.duplicate > 0 || self.delay > 0
    }

    pub fn restore(&mut self) {
        *self = Self::default();
    }
}

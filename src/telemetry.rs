//! APPLICATION-TELEMETRY block encoding.
//!
//! Every block is a fixed little-endian layout built from the latest wheel
//! snapshot plus the comms-side diagnostic counters.

use crate::fixed::{FixedPoint, Q16_16, Q24_8, SQ16_16, SQ24_8, SQ8_8};
use crate::tick::WheelSnapshot;
use heapless::Vec;
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_BLOCK_LEN: usize = 32;

pub const STANDARD_LEN: usize = 29;
pub const TEMPERATURES_LEN: usize = 4;
pub const VOLTAGES_LEN: usize = 8;
pub const CURRENTS_LEN: usize = 12;
pub const DIAGNOSTICS_LEN: usize = 32;

const_assert!(STANDARD_LEN <= MAX_BLOCK_LEN);
const_assert!(DIAGNOSTICS_LEN <= MAX_BLOCK_LEN);

pub type BlockBytes = Vec<u8, MAX_BLOCK_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TelemetryBlock {
    Standard = 0,
    Temperatures = 1,
    Voltages = 2,
    Currents = 3,
    Diagnostics = 4,
}

impl TelemetryBlock {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Standard),
            1 => Some(Self::Temperatures),
            2 => Some(Self::Voltages),
            3 => Some(Self::Currents),
            4 => Some(Self::Diagnostics),
            _ => None,
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::Standard => STANDARD_LEN,
            Self::Temperatures => TEMPERATURES_LEN,
            Self::Voltages => VOLTAGES_LEN,
            Self::Currents => CURRENTS_LEN,
            Self::Diagnostics => DIAGNOSTICS_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("unknown telemetry block {0}")]
    UnknownBlock(u8),
}

/// Counters owned by the communications side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    pub crc_errors: u32,
    pub framing_errors: u32,
    pub trip_count: u32,
    pub ring_overflows: u32,
}

/// Values a block needs beyond the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockContext {
    pub current_limit_a: f64,
    pub diagnostics: Diagnostics,
}

struct BlockWriter {
    out: BlockBytes,
}

impl BlockWriter {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        // Layouts are statically bounded by MAX_BLOCK_LEN.
        let _ = self.out.extend_from_slice(bytes);
    }

    fn u8(&mut self, value: u8) {
        self.bytes(&[value]);
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    fn fixed<T: FixedPoint>(&mut self, value: f64) {
        self.bytes(&T::from_f64(value).to_le_bytes());
    }
}

pub fn encode_block(
    id: u8,
    snap: &WheelSnapshot,
    ctx: &BlockContext,
) -> Result<BlockBytes, TelemetryError> {
    let block = TelemetryBlock::from_id(id).ok_or(TelemetryError::UnknownBlock(id))?;
    let state = &snap.state;
    let mut w = BlockWriter::new();

    match block {
        TelemetryBlock::Standard => {
            w.u32(snap.protection.fault_status);
            w.u32(snap.protection.latched);
            w.u32(snap.protection.warnings);
            w.u8(snap.mode.code());
            w.fixed::<SQ24_8>(state.speed_rpm());
            w.fixed::<SQ24_8>(snap.momentum_nms * 1000.0);
            w.fixed::<SQ16_16>(state.motor_torque_nm * 1000.0);
            w.fixed::<SQ16_16>(state.current_a);
        }
        TelemetryBlock::Temperatures => {
            w.fixed::<SQ8_8>(state.motor_temp_c);
            w.fixed::<SQ8_8>(state.driver_temp_c);
        }
        TelemetryBlock::Voltages => {
            w.fixed::<Q16_16>(state.bus_voltage_v);
            w.fixed::<SQ16_16>(state.applied_voltage_v);
        }
        TelemetryBlock::Currents => {
            w.fixed::<SQ16_16>(state.current_a);
            w.fixed::<SQ16_16>(state.current_cmd_a);
            w.fixed::<Q16_16>(ctx.current_limit_a);
        }
        TelemetryBlock::Diagnostics => {
            let d = &ctx.diagnostics;
            w.u32(u32::try_from(snap.uptime_ms / 1000).unwrap_or(u32::MAX));
            w.u32(saturating_u32(state.revolutions));
            w.fixed::<Q24_8>(state.energy_j);
            w.u32(d.crc_errors);
            w.u32(d.framing_errors);
            w.u32(d.trip_count);
            w.u32(d.ring_overflows);
            w.u32(snap.overruns);
        }
    }

    debug_assert_eq!(w.out.len(), block.len());
    Ok(w.out)
}

fn saturating_u32(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}

//! Register map: a static, address-sorted table plus the live register file.

use crate::fixed::{FixedPoint, WireBytes, Q16_16, Q24_8, SQ16_16, SQ24_8, SQ8_8};
use heapless::Vec;
use static_assertions::const_assert;
use thiserror::Error;

const MAX_STUCK_REGISTERS: usize = 8;

/// Register addresses.
pub mod addr {
    pub const DEVICE_ID: u16 = 0x0000;
    pub const FIRMWARE_VERSION: u16 = 0x0004;
    pub const SERIAL_NUMBER: u16 = 0x0008;
    pub const HARDWARE_REVISION: u16 = 0x000C;
    pub const RATED_SPEED_RPM: u16 = 0x0010;
    pub const INERTIA_UKGM2: u16 = 0x0014;
    pub const TORQUE_CONSTANT_UNM_A: u16 = 0x0018;

    pub const PROTECTION_ENABLE: u16 = 0x0100;
    pub const OVERVOLTAGE_LIMIT_V: u16 = 0x0104;
    pub const OVERCURRENT_SOFT_A: u16 = 0x0108;
    pub const OVERCURRENT_HARD_A: u16 = 0x010C;
    pub const OVERSPEED_SOFT_RPM: u16 = 0x0110;
    pub const OVERSPEED_FAULT_RPM: u16 = 0x0114;
    pub const OVERPOWER_LIMIT_W: u16 = 0x0118;
    pub const MAX_DUTY_PCT: u16 = 0x011C;
    pub const CURRENT_LIMIT_A: u16 = 0x0120;

    pub const CONTROL_MODE: u16 = 0x0200;
    pub const CURRENT_SETPOINT_A: u16 = 0x0204;
    pub const SPEED_SETPOINT_RPM: u16 = 0x0208;
    pub const TORQUE_SETPOINT_MNM: u16 = 0x020C;
    pub const PWM_DUTY_PCT: u16 = 0x0210;
    pub const DIRECTION: u16 = 0x0214;
    pub const SPEED_KP: u16 = 0x0218;
    pub const SPEED_KI: u16 = 0x021C;

    pub const SPEED_RPM: u16 = 0x0300;
    pub const CURRENT_A: u16 = 0x0304;
    pub const TORQUE_MNM: u16 = 0x0308;
    pub const BUS_VOLTAGE_V: u16 = 0x030C;
    pub const POWER_W: u16 = 0x0310;
    pub const MOMENTUM_MNMS: u16 = 0x0314;
    pub const MOTOR_TEMP_C: u16 = 0x0318;
    pub const DRIVER_TEMP_C: u16 = 0x031A;
    pub const UPTIME_S: u16 = 0x031C;
    pub const REVOLUTIONS: u16 = 0x0320;
    pub const ENERGY_J: u16 = 0x0324;
    pub const STATUS_FLAGS: u16 = 0x0328;

    pub const FAULT_STATUS: u16 = 0x0400;
    pub const FAULT_LATCH: u16 = 0x0404;
    pub const WARNING_STATUS: u16 = 0x0408;
    pub const CRC_ERROR_COUNT: u16 = 0x040C;
    pub const FRAMING_ERROR_COUNT: u16 = 0x0410;
    pub const TRIP_COUNT: u16 = 0x0414;
    pub const LAST_FAULT_CODE: u16 = 0x0418;
}

/// Field order of a CONFIGURE-PROTECTION payload after the enable mask.
pub const PROTECTION_THRESHOLDS: [u16; 8] = [
    addr::OVERVOLTAGE_LIMIT_V,
    addr::OVERCURRENT_SOFT_A,
    addr::OVERCURRENT_HARD_A,
    addr::OVERSPEED_SOFT_RPM,
    addr::OVERSPEED_FAULT_RPM,
    addr::OVERPOWER_LIMIT_W,
    addr::MAX_DUTY_PCT,
    addr::CURRENT_LIMIT_A,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    U8,
    U16,
    U32,
    Q16_16,
    Q24_8,
    SQ16_16,
    SQ24_8,
    SQ8_8,
}

impl RegKind {
    pub const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::SQ8_8 => 2,
            Self::U32 | Self::Q16_16 | Self::Q24_8 | Self::SQ16_16 | Self::SQ24_8 => 4,
        }
    }

    pub fn decode(self, raw: u32) -> f64 {
        match self {
            Self::U8 | Self::U16 | Self::U32 => f64::from(raw),
            Self::Q16_16 => Q16_16::from_raw(raw).to_f64(),
            Self::Q24_8 => Q24_8::from_raw(raw).to_f64(),
            Self::SQ16_16 => SQ16_16::from_raw(raw).to_f64(),
            Self::SQ24_8 => SQ24_8::from_raw(raw).to_f64(),
            Self::SQ8_8 => SQ8_8::from_raw(raw).to_f64(),
        }
    }

    pub fn encode(self, value: f64) -> u32 {
        match self {
            Self::U8 => saturate_integer(value, u32::from(u8::MAX)),
            Self::U16 => saturate_integer(value, u32::from(u16::MAX)),
            Self::U32 => saturate_integer(value, u32::MAX),
            Self::Q16_16 => Q16_16::from_f64(value).to_raw(),
            Self::Q24_8 => Q24_8::from_f64(value).to_raw(),
            Self::SQ16_16 => SQ16_16::from_f64(value).to_raw(),
            Self::SQ24_8 => SQ24_8::from_f64(value).to_raw(),
            Self::SQ8_8 => SQ8_8::from_f64(value).to_raw(),
        }
    }
}

fn saturate_integer(value: f64, max: u32) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else if value >= f64::from(max) {
        max
    } else {
        value.round() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    DeviceInfo,
    ProtectionConfig,
    Control,
    Status,
    Diagnostic,
    Unmapped,
}

impl RegisterClass {
    pub fn of(address: u16) -> Self {
        match address {
            0x0000..=0x00FF => Self::DeviceInfo,
            0x0100..=0x01FF => Self::ProtectionConfig,
            0x0200..=0x02FF => Self::Control,
            0x0300..=0x03FF => Self::Status,
            0x0400..=0x04FF => Self::Diagnostic,
            _ => Self::Unmapped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub address: u16,
    pub name: &'static str,
    pub kind: RegKind,
    pub access: Access,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

const fn ro(address: u16, name: &'static str, kind: RegKind, default: f64) -> RegisterDef {
    RegisterDef {
        address,
        name,
        kind,
        access: Access::ReadOnly,
        default,
        min: f64::MIN,
        max: f64::MAX,
    }
}

const fn rw(
    address: u16,
    name: &'static str,
    kind: RegKind,
    default: f64,
    min: f64,
    max: f64,
) -> RegisterDef {
    RegisterDef {
        address,
        name,
        kind,
        access: Access::ReadWrite,
        default,
        min,
        max,
    }
}

const U32_MAX: f64 = u32::MAX as f64;

const TABLE: [RegisterDef; 43] = [
    ro(addr::DEVICE_ID, "DEVICE_ID", RegKind::U32, 1_314_082_903.0),
    ro(addr::FIRMWARE_VERSION, "FIRMWARE_VERSION", RegKind::U32, 66_048.0),
    ro(addr::SERIAL_NUMBER, "SERIAL_NUMBER", RegKind::U32, 1_057.0),
    ro(addr::HARDWARE_REVISION, "HARDWARE_REVISION", RegKind::U16, 3.0),
    ro(addr::RATED_SPEED_RPM, "RATED_SPEED_RPM", RegKind::U16, 5_000.0),
    ro(addr::INERTIA_UKGM2, "INERTIA_UKGM2", RegKind::U32, 1_200.0),
    ro(addr::TORQUE_CONSTANT_UNM_A, "TORQUE_CONSTANT_UNM_A", RegKind::U32, 25_000.0),
    rw(addr::PROTECTION_ENABLE, "PROTECTION_ENABLE", RegKind::U32, 799.0, 0.0, 1_023.0),
    rw(addr::OVERVOLTAGE_LIMIT_V, "OVERVOLTAGE_LIMIT_V", RegKind::Q16_16, 36.0, 0.0, 60.0),
    rw(addr::OVERCURRENT_SOFT_A, "OVERCURRENT_SOFT_A", RegKind::Q16_16, 4.0, 0.0, 10.0),
    rw(addr::OVERCURRENT_HARD_A, "OVERCURRENT_HARD_A", RegKind::Q16_16, 6.0, 0.0, 10.0),
    rw(addr::OVERSPEED_SOFT_RPM, "OVERSPEED_SOFT_RPM", RegKind::U32, 5_000.0, 0.0, 10_000.0),
    rw(addr::OVERSPEED_FAULT_RPM, "OVERSPEED_FAULT_RPM", RegKind::U32, 6_000.0, 0.0, 10_000.0),
    rw(addr::OVERPOWER_LIMIT_W, "OVERPOWER_LIMIT_W", RegKind::Q16_16, 150.0, 0.0, 500.0),
    rw(addr::MAX_DUTY_PCT, "MAX_DUTY_PCT", RegKind::Q16_16, 98.0, 0.0, 100.0),
    rw(addr::CURRENT_LIMIT_A, "CURRENT_LIMIT_A", RegKind::Q16_16, 5.0, 0.0, 10.0),
    rw(addr::CONTROL_MODE, "CONTROL_MODE", RegKind::U8, 0.0, 0.0, 4.0),
    rw(addr::CURRENT_SETPOINT_A, "CURRENT_SETPOINT_A", RegKind::Q16_16, 0.0, 0.0, 10.0),
    rw(addr::SPEED_SETPOINT_RPM, "SPEED_SETPOINT_RPM", RegKind::Q24_8, 0.0, 0.0, 8_000.0),
    rw(addr::TORQUE_SETPOINT_MNM, "TORQUE_SETPOINT_MNM", RegKind::Q16_16, 0.0, 0.0, 250.0),
    rw(addr::PWM_DUTY_PCT, "PWM_DUTY_PCT", RegKind::Q16_16, 0.0, 0.0, 100.0),
    rw(addr::DIRECTION, "DIRECTION", RegKind::U8, 0.0, 0.0, 1.0),
    rw(addr::SPEED_KP, "SPEED_KP", RegKind::Q16_16, 0.02, 0.0, 10.0),
    rw(addr::SPEED_KI, "SPEED_KI", RegKind::Q16_16, 0.2, 0.0, 100.0),
    ro(addr::SPEED_RPM, "SPEED_RPM", RegKind::SQ24_8, 0.0),
    ro(addr::CURRENT_A, "CURRENT_A", RegKind::SQ16_16, 0.0),
    ro(addr::TORQUE_MNM, "TORQUE_MNM", RegKind::SQ16_16, 0.0),
    ro(addr::BUS_VOLTAGE_V, "BUS_VOLTAGE_V", RegKind::Q16_16, 28.0),
    ro(addr::POWER_W, "POWER_W", RegKind::SQ16_16, 0.0),
    ro(addr::MOMENTUM_MNMS, "MOMENTUM_MNMS", RegKind::SQ24_8, 0.0),
    ro(addr::MOTOR_TEMP_C, "MOTOR_TEMP_C", RegKind::SQ8_8, 20.0),
    ro(addr::DRIVER_TEMP_C, "DRIVER_TEMP_C", RegKind::SQ8_8, 20.0),
    ro(addr::UPTIME_S, "UPTIME_S", RegKind::U32, 0.0),
    ro(addr::REVOLUTIONS, "REVOLUTIONS", RegKind::U32, 0.0),
    ro(addr::ENERGY_J, "ENERGY_J", RegKind::Q24_8, 0.0),
    ro(addr::STATUS_FLAGS, "STATUS_FLAGS", RegKind::U32, 0.0),
    ro(addr::FAULT_STATUS, "FAULT_STATUS", RegKind::U32, 0.0),
    ro(addr::FAULT_LATCH, "FAULT_LATCH", RegKind::U32, 0.0),
    ro(addr::WARNING_STATUS, "WARNING_STATUS", RegKind::U32, 0.0),
    rw(addr::CRC_ERROR_COUNT, "CRC_ERROR_COUNT", RegKind::U32, 0.0, 0.0, U32_MAX),
    rw(addr::FRAMING_ERROR_COUNT, "FRAMING_ERROR_COUNT", RegKind::U32, 0.0, 0.0, U32_MAX),
    rw(addr::TRIP_COUNT, "TRIP_COUNT", RegKind::U32, 0.0, 0.0, U32_MAX),
    rw(addr::LAST_FAULT_CODE, "LAST_FAULT_CODE", RegKind::U8, 0.0, 0.0, 255.0),
];

pub const REGISTER_COUNT: usize = TABLE.len();

const fn table_is_sorted(table: &[RegisterDef]) -> bool {
    let mut i = 1;
    while i < table.len() {
        if table[i - 1].address >= table[i].address {
            return false;
        }
        i += 1;
    }
    true
}

const_assert!(table_is_sorted(&TABLE));

pub static REGISTERS: &[RegisterDef] = &TABLE;

/// Find a register by address.
pub fn lookup(address: u16) -> Option<(usize, &'static RegisterDef)> {
    REGISTERS
        .binary_search_by_key(&address, |def| def.address)
        .ok()
        .map(|index| (index, &REGISTERS[index]))
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RegisterError {
    #[error("unknown register 0x{0:04X}")]
    UnknownRegister(u16),
    #[error("register 0x{0:04X} is read-only")]
    ReadOnly(u16),
    #[error("register 0x{address:04X} takes {expected} bytes, got {got}")]
    InvalidLength { address: u16, expected: usize, got: usize },
    #[error("value {value} out of range for register 0x{address:04X}")]
    OutOfRange { address: u16, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StuckRegister {
    address: u16,
    raw: u32,
}

/// Live register values, stored as raw wire bits parallel to the table.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    values: [u32; REGISTER_COUNT],
    stuck: Vec<StuckRegister, MAX_STUCK_REGISTERS>,
}

impl RegisterFile {
    pub fn new() -> Self {
        let mut values = [0u32; REGISTER_COUNT];
        for (slot, def) in values.iter_mut().zip(REGISTERS.iter()) {
            *slot = def.kind.encode(def.default);
        }
        Self {
            values,
            stuck: Vec::new(),
        }
    }

    /// PEEK: raw little-endian bytes, any access mode.
    pub fn peek(&self, address: u16) -> Result<WireBytes, RegisterError> {
        let (index, def) = lookup(address).ok_or(RegisterError::UnknownRegister(address))?;
        let raw = self
            .stuck
            .iter()
            .find(|s| s.address == address)
            .map_or(self.values[index], |s| s.raw);
        Ok(raw_to_bytes(raw, def.kind.width()))
    }

    /// Check a POKE without committing it. Returns the raw bits to store.
    pub fn validate(&self, address: u16, bytes: &[u8]) -> Result<u32, RegisterError> {
        let (_, def) = lookup(address).ok_or(RegisterError::UnknownRegister(address))?;
        if def.access == Access::ReadOnly {
            return Err(RegisterError::ReadOnly(address));
        }
        let expected = def.kind.width();
        if bytes.len() != expected {
            return Err(RegisterError::InvalidLength {
                address,
                expected,
                got: bytes.len(),
            });
        }
        let mut buf = [0u8; 4];
        buf[..expected].copy_from_slice(bytes);
        let raw = u32::from_le_bytes(buf);
        let value = def.kind.decode(raw);
        if value < def.min || value > def.max {
            return Err(RegisterError::OutOfRange { address, value });
        }
        Ok(raw)
    }

    /// POKE: validated, all-or-nothing write.
    pub fn poke(&mut self, address: u16, bytes: &[u8]) -> Result<(), RegisterError> {
        let raw = self.validate(address, bytes)?;
        self.store_raw(address, raw);
        Ok(())
    }

    /// Engineering value of a register, ignoring scenario forcing.
    pub fn get(&self, address: u16) -> f64 {
        match lookup(address) {
            Some((index, def)) => def.kind.decode(self.values[index]),
            None => {
                debug_assert!(false, "read of unmapped register 0x{address:04X}");
                0.0
            }
        }
    }

    pub fn get_raw(&self, address: u16) -> u32 {
        lookup(address).map_or(0, |(index, _)| self.values[index])
    }

    /// Device-side update that bypasses access and range checks; used to
    /// mirror physics state into the status and fault ranges.
    pub fn set(&mut self, address: u16, value: f64) {
        if let Some((index, def)) = lookup(address) {
            self.values[index] = def.kind.encode(value);
        } else {
            debug_assert!(false, "write of unmapped register 0x{address:04X}");
        }
    }

    pub fn store_raw(&mut self, address: u16, raw: u32) {
        if let Some((index, def)) = lookup(address) {
            self.values[index] = raw & width_mask(def.kind.width());
        }
    }

    pub fn increment(&mut self, address: u16) {
        let next = self.get_raw(address).wrapping_add(1);
        self.store_raw(address, next);
    }

    /// Force PEEK of `address` to return `raw` until released.
    pub fn force(&mut self, address: u16, raw: u32) -> Result<(), RegisterError> {
        let (_, def) = lookup(address).ok_or(RegisterError::UnknownRegister(address))?;
        let raw = raw & width_mask(def.kind.width());
        if let Some(existing) = self.stuck.iter_mut().find(|s| s.address == address) {
            existing.raw = raw;
            return Ok(());
        }
        if self.stuck.is_full() {
            self.stuck.remove(0);
        }
        let _ = self.stuck.push(StuckRegister { address, raw });
        Ok(())
    }

    pub fn release(&mut self, address: u16) {
        self.stuck.retain(|s| s.address != address);
    }

    pub fn release_all(&mut self) {
        self.stuck.clear();
    }

    pub fn is_forced(&self, address: u16) -> bool {
        self.stuck.iter().any(|s| s.address == address)
    }

    pub fn any_forced(&self) -> bool {
        !self.stuck.is_empty()
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

fn width_mask(width: usize) -> u32 {
    if width >= 4 {
        u32::MAX
    } else {
        (1u32 << (width * 8)) - 1
    }
}

fn raw_to_bytes(raw: u32, width: usize) -> WireBytes {
    let mut out = WireBytes::new();
    for &byte in &raw.to_le_bytes()[..width] {
        let _ = out.push(byte);
    }
    out
}

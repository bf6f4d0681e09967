//! Threshold protection evaluated once per physics tick.
//!
//! Hard checks run in a fixed priority order (voltage, current, speed, power,
//! duty); the first live condition that is not already latched trips. Soft
//! checks only raise warning bits, recomputed every tick.

use crate::registers::{addr, RegisterFile};
use crate::subsystems::WheelState;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod fault_bits {
    pub const OVERVOLTAGE: u32 = 1 << 0;
    pub const OVERCURRENT: u32 = 1 << 1;
    pub const OVERSPEED: u32 = 1 << 2;
    pub const OVERPOWER: u32 = 1 << 3;
    pub const OVERDUTY: u32 = 1 << 4;
    pub const LCL_TRIP: u32 = 1 << 5;
    pub const ALL: u32 = 0x3F;
}

pub mod warning_bits {
    pub const SOFT_OVERCURRENT: u32 = 1 << 0;
    pub const SOFT_OVERSPEED: u32 = 1 << 1;
}

pub mod enable_bits {
    pub const HARD_CHECKS: u32 = 0x1F;
    pub const SOFT_OVERCURRENT: u32 = 1 << 8;
    pub const SOFT_OVERSPEED: u32 = 1 << 9;
    pub const DEFAULT: u32 = 0x31F;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    Overvoltage,
    Overcurrent,
    Overspeed,
    Overpower,
    Overduty,
    LclTrip,
}

impl FaultKind {
    /// Hard checks in evaluation priority order.
    pub const PRIORITY: [FaultKind; 5] = [
        FaultKind::Overvoltage,
        FaultKind::Overcurrent,
        FaultKind::Overspeed,
        FaultKind::Overpower,
        FaultKind::Overduty,
    ];

    pub const ALL: [FaultKind; 6] = [
        FaultKind::Overvoltage,
        FaultKind::Overcurrent,
        FaultKind::Overspeed,
        FaultKind::Overpower,
        FaultKind::Overduty,
        FaultKind::LclTrip,
    ];

    pub fn bit(self) -> u32 {
        match self {
            Self::Overvoltage => fault_bits::OVERVOLTAGE,
            Self::Overcurrent => fault_bits::OVERCURRENT,
            Self::Overspeed => fault_bits::OVERSPEED,
            Self::Overpower => fault_bits::OVERPOWER,
            Self::Overduty => fault_bits::OVERDUTY,
            Self::LclTrip => fault_bits::LCL_TRIP,
        }
    }

    /// Value reported in LAST_FAULT_CODE: bit index plus one, zero meaning none.
    pub fn code(self) -> u8 {
        self.bit().trailing_zeros() as u8 + 1
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "overvoltage" => Some(Self::Overvoltage),
            "overcurrent" => Some(Self::Overcurrent),
            "overspeed" => Some(Self::Overspeed),
            "overpower" => Some(Self::Overpower),
            "overduty" => Some(Self::Overduty),
            "lcl" | "lcl_trip" => Some(Self::LclTrip),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Overvoltage => "overvoltage",
            Self::Overcurrent => "overcurrent",
            Self::Overspeed => "overspeed",
            Self::Overpower => "overpower",
            Self::Overduty => "overduty",
            Self::LclTrip => "lcl_trip",
        }
    }
}

/// Protection thresholds and enable mask, mirrored from the 0x01xx registers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    pub enable_mask: u32,
    pub overvoltage_v: f64,
    pub overcurrent_soft_a: f64,
    pub overcurrent_hard_a: f64,
    pub overspeed_soft_rpm: f64,
    pub overspeed_fault_rpm: f64,
    pub overpower_w: f64,
    pub max_duty_pct: f64,
    pub current_limit_a: f64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enable_mask: enable_bits::DEFAULT,
            overvoltage_v: 36.0,
            overcurrent_soft_a: 4.0,
            overcurrent_hard_a: 6.0,
            overspeed_soft_rpm: 5000.0,
            overspeed_fault_rpm: 6000.0,
            overpower_w: 150.0,
            max_duty_pct: 98.0,
            current_limit_a: 5.0,
        }
    }
}

impl ProtectionConfig {
    pub fn from_registers(regs: &RegisterFile) -> Self {
        Self {
            enable_mask: regs.get_raw(addr::PROTECTION_ENABLE),
            overvoltage_v: regs.get(addr::OVERVOLTAGE_LIMIT_V),
            overcurrent_soft_a: regs.get(addr::OVERCURRENT_SOFT_A),
            overcurrent_hard_a: regs.get(addr::OVERCURRENT_HARD_A),
            overspeed_soft_rpm: regs.get(addr::OVERSPEED_SOFT_RPM),
            overspeed_fault_rpm: regs.get(addr::OVERSPEED_FAULT_RPM),
            overpower_w: regs.get(addr::OVERPOWER_LIMIT_W),
            max_duty_pct: regs.get(addr::MAX_DUTY_PCT),
            current_limit_a: regs.get(addr::CURRENT_LIMIT_A),
        }
    }

    fn enabled(&self, bit: u32) -> bool {
        self.enable_mask & bit != 0
    }
}

/// The quantities protection looks at, in protection units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurements {
    pub bus_voltage_v: f64,
    pub current_a: f64,
    pub speed_rpm: f64,
    pub power_w: f64,
    pub duty_pct: f64,
}

impl Measurements {
    pub fn from_state(state: &WheelState) -> Self {
        Self {
            bus_voltage_v: state.bus_voltage_v,
            current_a: state.current_a.abs(),
            speed_rpm: state.speed_rpm().abs(),
            power_w: state.power_w.abs(),
            duty_pct: state.duty * 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtectionState {
    /// Hard conditions live this tick among enabled checks.
    pub fault_status: u32,
    /// Sticky trip bits, cleared only by a successful clear.
    pub latched: u32,
    pub warnings: u32,
    pub trip_count: u32,
    pub last_trip: Option<FaultKind>,
    /// Latched bits that came from a forced trip rather than a measurement.
    pub forced: u32,
}

impl ProtectionState {
    pub fn output_enabled(&self) -> bool {
        self.latched == 0
    }

    /// Requested latched bits that a clear would refuse right now.
    pub fn blocking_clear(&self, mask: u32) -> u32 {
        mask & self.latched & self.fault_status & !self.forced & !fault_bits::LCL_TRIP
    }
}

#[derive(Debug)]
pub struct ProtectionSystem {
    config: ProtectionConfig,
    state: ProtectionState,
}

impl ProtectionSystem {
    pub fn new(config: ProtectionConfig) -> Self {
        Self {
            config,
            state: ProtectionState::default(),
        }
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ProtectionConfig) {
        self.config = config;
    }

    pub fn state(&self) -> &ProtectionState {
        &self.state
    }

    /// Live hard conditions among enabled checks.
    pub fn live_conditions(&self, m: &Measurements) -> u32 {
        let c = &self.config;
        let mut live = 0;
        for kind in FaultKind::PRIORITY {
            if !c.enabled(kind.bit()) {
                continue;
            }
            let tripped = match kind {
                FaultKind::Overvoltage => m.bus_voltage_v > c.overvoltage_v,
                FaultKind::Overcurrent => m.current_a > c.overcurrent_hard_a,
                FaultKind::Overspeed => m.speed_rpm > c.overspeed_fault_rpm,
                FaultKind::Overpower => m.power_w > c.overpower_w,
                FaultKind::Overduty => m.duty_pct > c.max_duty_pct,
                FaultKind::LclTrip => false,
            };
            if tripped {
                live |= kind.bit();
            }
        }
        live
    }

    fn warnings(&self, m: &Measurements) -> u32 {
        let c = &self.config;
        let mut warnings = 0;
        if c.enabled(enable_bits::SOFT_OVERCURRENT) && m.current_a > c.overcurrent_soft_a {
            warnings |= warning_bits::SOFT_OVERCURRENT;
        }
        if c.enabled(enable_bits::SOFT_OVERSPEED) && m.speed_rpm > c.overspeed_soft_rpm {
            warnings |= warning_bits::SOFT_OVERSPEED;
        }
        warnings
    }

    /// Run one protection pass. Returns the fault that tripped this tick.
    pub fn evaluate(&mut self, m: &Measurements) -> Option<FaultKind> {
        let live = self.live_conditions(m);
        self.state.fault_status = live;
        self.state.warnings = self.warnings(m);

        let first = FaultKind::PRIORITY
            .into_iter()
            .find(|kind| live & kind.bit() != 0)?;
        if self.state.latched & first.bit() != 0 {
            return None;
        }
        self.latch(first, false);
        warn!(fault = first.name(), trips = self.state.trip_count, "protection trip");
        Some(first)
    }

    /// Latch a fault without a measured condition (TRIP-LCL or scenario).
    pub fn force_trip(&mut self, kind: FaultKind) {
        if self.state.latched & kind.bit() != 0 {
            self.state.forced |= kind.bit();
            return;
        }
        self.latch(kind, true);
        warn!(fault = kind.name(), "forced protection trip");
    }

    fn latch(&mut self, kind: FaultKind, forced: bool) {
        self.state.latched |= kind.bit();
        if forced {
            self.state.forced |= kind.bit();
        }
        self.state.trip_count = self.state.trip_count.wrapping_add(1);
        self.state.last_trip = Some(kind);
    }

    /// Clear requested latches whose condition is gone this tick.
    ///
    /// Returns the requested bits that stay latched, if any.
    pub fn clear(&mut self, mask: u32) -> Result<(), u32> {
        let blocked = self.state.blocking_clear(mask);
        let cleared = mask & self.state.latched & !blocked;
        self.state.latched &= !cleared;
        self.state.forced &= !cleared;
        if cleared != 0 {
            info!(cleared = format_args!("0x{cleared:02X}"), "protection latch cleared");
        }
        if blocked == 0 {
            Ok(())
        } else {
            Err(blocked)
        }
    }
}

impl Default for ProtectionSystem {
    fn default() -> Self {
        Self::new(ProtectionConfig::default())
    }
}

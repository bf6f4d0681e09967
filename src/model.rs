//! Communications-side device model.
//!
//! Holds the register file, the latest physics snapshot and the control
//! record sent to the physics context. Register writes are translated into
//! `ControlCommand` updates here; status and fault registers are mirrored
//! from each snapshot.

use crate::fixed::WireBytes;
use crate::protection::{fault_bits, FaultKind, ProtectionConfig};
use crate::registers::{addr, lookup, RegisterClass, RegisterError, RegisterFile, PROTECTION_THRESHOLDS};
use crate::subsystems::{ClampQuantity, ControlMode, Direction, PhysicsClamp};
use crate::telemetry::{encode_block, BlockBytes, BlockContext, Diagnostics, TelemetryError};
use crate::tick::{ControlCommand, WheelSnapshot};
use tracing::{debug, info};

/// Bits of the STATUS_FLAGS register.
pub mod status_flags {
    pub const OUTPUT_ENABLED: u32 = 1 << 0;
    pub const FAULT_LATCHED: u32 = 1 << 1;
    pub const WARNING_ACTIVE: u32 = 1 << 2;
    pub const SCENARIO_ACTIVE: u32 = 1 << 3;
    pub const CLAMP_ACTIVE: u32 = 1 << 4;
    pub const REGISTER_FORCED: u32 = 1 << 5;
}

/// Register that carries the setpoint for `mode`, if it takes one.
pub fn setpoint_register(mode: ControlMode) -> Option<u16> {
    match mode {
        ControlMode::Idle => None,
        ControlMode::Current => Some(addr::CURRENT_SETPOINT_A),
        ControlMode::Speed => Some(addr::SPEED_SETPOINT_RPM),
        ControlMode::Torque => Some(addr::TORQUE_SETPOINT_MNM),
        ControlMode::Pwm => Some(addr::PWM_DUTY_PCT),
    }
}

#[derive(Debug, Clone)]
pub struct DeviceModel {
    registers: RegisterFile,
    snapshot: WheelSnapshot,
    command: ControlCommand,
    command_dirty: bool,
    // Masks requested but not yet acknowledged by the physics side.
    pending_clear: u32,
    pending_trip: u32,
    trip_count_offset: u32,
    last_trip_count: u32,
    ring_overflows: u32,
    scenario_active: bool,
}

impl DeviceModel {
    pub fn new() -> Self {
        let registers = RegisterFile::new();
        let mut model = Self {
            registers,
            snapshot: WheelSnapshot::default(),
            command: ControlCommand::default(),
            command_dirty: false,
            pending_clear: 0,
            pending_trip: 0,
            trip_count_offset: 0,
            last_trip_count: 0,
            ring_overflows: 0,
            scenario_active: false,
        };
        model.sync_control();
        model.sync_protection();
        model.command_dirty = false;
        model
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn snapshot(&self) -> &WheelSnapshot {
        &self.snapshot
    }

    pub fn command(&self) -> &ControlCommand {
        &self.command
    }

    /// The control record if it changed since the last call.
    pub fn take_command(&mut self) -> Option<ControlCommand> {
        if self.command_dirty {
            self.command_dirty = false;
            Some(self.command)
        } else {
            None
        }
    }

    pub fn peek(&self, address: u16) -> Result<WireBytes, RegisterError> {
        self.registers.peek(address)
    }

    /// POKE with the side effects of each register class.
    pub fn poke(&mut self, address: u16, bytes: &[u8]) -> Result<(), RegisterError> {
        let raw = self.registers.validate(address, bytes)?;
        self.registers.store_raw(address, raw);

        match RegisterClass::of(address) {
            RegisterClass::ProtectionConfig => self.sync_protection(),
            RegisterClass::Control => self.sync_control(),
            RegisterClass::Diagnostic if address == addr::TRIP_COUNT => {
                // Reported count = physics count - offset.
                self.trip_count_offset = self.snapshot.protection.trip_count.wrapping_sub(raw);
            }
            _ => {}
        }
        debug!(address = format_args!("0x{address:04X}"), raw, "register written");
        Ok(())
    }

    /// APP-COMMAND: mode, direction and setpoint as one all-or-nothing write.
    pub fn app_command(
        &mut self,
        mode: ControlMode,
        direction: u8,
        setpoint: &[u8],
    ) -> Result<(), RegisterError> {
        let direction_raw = self.registers.validate(addr::DIRECTION, &[direction])?;
        let setpoint = match setpoint_register(mode) {
            Some(address) => Some((address, self.registers.validate(address, setpoint)?)),
            None => None,
        };

        self.registers
            .store_raw(addr::CONTROL_MODE, u32::from(mode.code()));
        self.registers.store_raw(addr::DIRECTION, direction_raw);
        if let Some((address, raw)) = setpoint {
            self.registers.store_raw(address, raw);
        }
        self.sync_control();
        info!(mode = ?mode, direction, "application command accepted");
        Ok(())
    }

    /// CONFIGURE-PROTECTION: enable mask followed by every threshold in
    /// register order, each in its register encoding.
    pub fn configure_protection(&mut self, payload: &[u8]) -> Result<(), RegisterError> {
        let mut writes = [(0u16, 0u32); PROTECTION_THRESHOLDS.len() + 1];
        let mut offset = 0;
        let fields = core::iter::once(addr::PROTECTION_ENABLE).chain(PROTECTION_THRESHOLDS);
        for (slot, address) in writes.iter_mut().zip(fields) {
            let width = lookup(address)
                .map(|(_, def)| def.kind.width())
                .ok_or(RegisterError::UnknownRegister(address))?;
            let field = payload.get(offset..offset + width).ok_or(
                RegisterError::InvalidLength {
                    address,
                    expected: width,
                    got: payload.len().saturating_sub(offset),
                },
            )?;
            *slot = (address, self.registers.validate(address, field)?);
            offset += width;
        }
        if offset != payload.len() {
            return Err(RegisterError::InvalidLength {
                address: addr::PROTECTION_ENABLE,
                expected: offset,
                got: payload.len(),
            });
        }

        for (address, raw) in writes {
            self.registers.store_raw(address, raw);
        }
        self.sync_protection();
        info!(
            enable = format_args!("0x{:03X}", self.command.protection.enable_mask),
            "protection reconfigured"
        );
        Ok(())
    }

    /// CLEAR-FAULT against the latest snapshot.
    ///
    /// Clearable bits are requested from the physics side; the bits whose
    /// condition is still live are returned as the error.
    pub fn clear_fault(&mut self, mask: u32) -> Result<(), u32> {
        let mask = mask & fault_bits::ALL;
        let blocked = self.snapshot.protection.blocking_clear(mask);
        let clearable = mask & !blocked;
        if clearable != 0 {
            self.pending_clear |= clearable;
            self.command.clear_seq = self.command.clear_seq.wrapping_add(1);
            self.command.clear_mask = self.pending_clear;
            self.command_dirty = true;
        }
        if blocked == 0 {
            Ok(())
        } else {
            Err(blocked)
        }
    }

    /// Request a forced latch of `kind` (TRIP-LCL or scenario trip).
    pub fn trip(&mut self, kind: FaultKind) {
        // An earlier clear still in flight must not undo this trip.
        self.pending_clear &= !kind.bit();
        self.command.clear_mask &= !kind.bit();
        self.pending_trip |= kind.bit();
        self.command.trip_seq = self.command.trip_seq.wrapping_add(1);
        self.command.trip_mask = self.pending_trip;
        self.command_dirty = true;
    }

    pub fn set_clamp(&mut self, clamp: Option<PhysicsClamp>) {
        if self.command.clamp != clamp {
            self.command.clamp = clamp;
            self.command_dirty = true;
        }
    }

    /// Drop the clamp on `quantity`, leaving a clamp on anything else alone.
    pub fn release_clamp(&mut self, quantity: ClampQuantity) {
        if self.command.clamp.map(|c| c.quantity) == Some(quantity) {
            self.set_clamp(None);
        }
    }

    pub fn force_register(&mut self, address: u16, raw: u32) -> Result<(), RegisterError> {
        self.registers.force(address, raw)
    }

    pub fn release_register(&mut self, address: u16) {
        self.registers.release(address);
    }

    pub fn release_all_registers(&mut self) {
        self.registers.release_all();
    }

    pub fn set_scenario_active(&mut self, active: bool) {
        self.scenario_active = active;
        self.update_status_flags();
    }

    pub fn set_ring_overflows(&mut self, count: u32) {
        self.ring_overflows = count;
    }

    pub fn count_crc_error(&mut self) {
        self.registers.increment(addr::CRC_ERROR_COUNT);
    }

    pub fn count_framing_error(&mut self) {
        self.registers.increment(addr::FRAMING_ERROR_COUNT);
    }

    /// Mirror a physics snapshot into the status and fault registers.
    pub fn apply_snapshot(&mut self, snap: WheelSnapshot) {
        let state = &snap.state;
        let regs = &mut self.registers;
        regs.set(addr::SPEED_RPM, state.speed_rpm());
        regs.set(addr::CURRENT_A, state.current_a);
        regs.set(addr::TORQUE_MNM, state.motor_torque_nm * 1000.0);
        regs.set(addr::BUS_VOLTAGE_V, state.bus_voltage_v);
        regs.set(addr::POWER_W, state.power_w);
        regs.set(addr::MOMENTUM_MNMS, snap.momentum_nms * 1000.0);
        regs.set(addr::MOTOR_TEMP_C, state.motor_temp_c);
        regs.set(addr::DRIVER_TEMP_C, state.driver_temp_c);
        regs.set(addr::UPTIME_S, (snap.uptime_ms / 1000) as f64);
        regs.set(addr::REVOLUTIONS, state.revolutions.floor());
        regs.set(addr::ENERGY_J, state.energy_j);

        let protection = &snap.protection;
        regs.store_raw(addr::FAULT_STATUS, protection.fault_status);
        regs.store_raw(addr::FAULT_LATCH, protection.latched);
        regs.store_raw(addr::WARNING_STATUS, protection.warnings);

        if protection.trip_count != self.last_trip_count {
            self.last_trip_count = protection.trip_count;
            if let Some(kind) = protection.last_trip {
                regs.store_raw(addr::LAST_FAULT_CODE, u32::from(kind.code()));
            }
        }
        regs.store_raw(
            addr::TRIP_COUNT,
            protection.trip_count.wrapping_sub(self.trip_count_offset),
        );

        if snap.clear_ack == self.command.clear_seq {
            self.pending_clear = 0;
        }
        if snap.trip_ack == self.command.trip_seq {
            self.pending_trip = 0;
        }

        self.snapshot = snap;
        self.update_status_flags();
    }

    fn update_status_flags(&mut self) {
        let protection = &self.snapshot.protection;
        let mut flags = 0;
        if protection.output_enabled() {
            flags |= status_flags::OUTPUT_ENABLED;
        }
        if protection.latched != 0 {
            flags |= status_flags::FAULT_LATCHED;
        }
        if protection.warnings != 0 {
            flags |= status_flags::WARNING_ACTIVE;
        }
        if self.scenario_active {
            flags |= status_flags::SCENARIO_ACTIVE;
        }
        if self.command.clamp.is_some() {
            flags |= status_flags::CLAMP_ACTIVE;
        }
        if self.registers.any_forced() {
            flags |= status_flags::REGISTER_FORCED;
        }
        self.registers.store_raw(addr::STATUS_FLAGS, flags);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            crc_errors: self.registers.get_raw(addr::CRC_ERROR_COUNT),
            framing_errors: self.registers.get_raw(addr::FRAMING_ERROR_COUNT),
            trip_count: self.registers.get_raw(addr::TRIP_COUNT),
            ring_overflows: self.ring_overflows,
        }
    }

    pub fn telemetry(&self, block: u8) -> Result<BlockBytes, TelemetryError> {
        let ctx = BlockContext {
            current_limit_a: self.command.protection.current_limit_a,
            diagnostics: self.diagnostics(),
        };
        encode_block(block, &self.snapshot, &ctx)
    }

    fn sync_protection(&mut self) {
        self.command.protection = ProtectionConfig::from_registers(&self.registers);
        self.command_dirty = true;
    }

    fn sync_control(&mut self) {
        let regs = &self.registers;
        // Register ranges keep both codes valid.
        let mode = ControlMode::from_code(regs.get_raw(addr::CONTROL_MODE) as u8)
            .unwrap_or(ControlMode::Idle);
        let direction = Direction::from_code(regs.get_raw(addr::DIRECTION) as u8)
            .unwrap_or(Direction::Positive);

        self.command.mode = mode;
        self.command.direction = direction;
        self.command.setpoint = setpoint_register(mode).map_or(0.0, |a| regs.get(a));
        self.command.speed_kp = regs.get(addr::SPEED_KP);
        self.command.speed_ki = regs.get(addr::SPEED_KI);
        self.command_dirty = true;
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

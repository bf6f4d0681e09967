//! Wheel physics: motor drive, power bus and thermal models stepped at a
//! fixed 10 ms cadence.
//!
//! [`integrate`] is a pure function of the previous state, the drive input
//! and the parameters. The physics-tick context owns the only `WheelState`.

pub mod motor;
pub mod power;
pub mod thermal;

use serde::{Deserialize, Serialize};

/// Integration step in seconds.
pub const DT_S: f64 = 0.01;
/// Integration step in milliseconds.
pub const TICK_PERIOD_MS: u64 = 10;

pub const RAD_S_PER_RPM: f64 = core::f64::consts::PI / 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlMode {
    #[default]
    Idle = 0,
    Current = 1,
    Speed = 2,
    Torque = 3,
    Pwm = 4,
}

impl ControlMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Current),
            2 => Some(Self::Speed),
            3 => Some(Self::Torque),
            4 => Some(Self::Pwm),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    #[default]
    Positive = 0,
    Negative = 1,
}

impl Direction {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Positive),
            1 => Some(Self::Negative),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

/// Physical constants of the wheel assembly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelParams {
    pub inertia_kgm2: f64,
    pub torque_constant_nm_a: f64,
    pub winding_resistance_ohm: f64,
    pub viscous_friction_nms: f64,
    pub coulomb_friction_nm: f64,
    /// Drag torque per watt of copper loss.
    pub copper_loss_nm_w: f64,
    pub bus_voltage_nominal_v: f64,
    pub source_resistance_ohm: f64,
    pub ambient_temp_c: f64,
    pub motor_thermal_resistance_k_w: f64,
    pub motor_thermal_capacitance_j_k: f64,
    pub driver_thermal_resistance_k_w: f64,
    pub driver_thermal_capacitance_j_k: f64,
    /// Fraction of electrical power dissipated in the driver stage.
    pub driver_loss_fraction: f64,
}

impl Default for WheelParams {
    fn default() -> Self {
        Self {
            inertia_kgm2: 0.0012,
            torque_constant_nm_a: 0.025,
            winding_resistance_ohm: 1.2,
            viscous_friction_nms: 2.0e-6,
            coulomb_friction_nm: 1.0e-4,
            copper_loss_nm_w: 5.0e-4,
            bus_voltage_nominal_v: 28.0,
            source_resistance_ohm: 0.15,
            ambient_temp_c: 20.0,
            motor_thermal_resistance_k_w: 3.0,
            motor_thermal_capacitance_j_k: 40.0,
            driver_thermal_resistance_k_w: 5.0,
            driver_thermal_capacitance_j_k: 20.0,
            driver_loss_fraction: 0.05,
        }
    }
}

/// Complete dynamic state of the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelState {
    pub speed_rad_s: f64,
    pub current_a: f64,
    pub current_cmd_a: f64,
    pub motor_torque_nm: f64,
    pub applied_voltage_v: f64,
    pub bus_voltage_v: f64,
    pub power_w: f64,
    pub duty: f64,
    pub motor_temp_c: f64,
    pub driver_temp_c: f64,
    pub energy_j: f64,
    pub revolutions: f64,
    pub pi_integral: f64,
    pub ticks: u64,
}

impl WheelState {
    pub fn new(params: &WheelParams) -> Self {
        Self {
            speed_rad_s: 0.0,
            current_a: 0.0,
            current_cmd_a: 0.0,
            motor_torque_nm: 0.0,
            applied_voltage_v: 0.0,
            bus_voltage_v: params.bus_voltage_nominal_v,
            power_w: 0.0,
            duty: 0.0,
            motor_temp_c: params.ambient_temp_c,
            driver_temp_c: params.ambient_temp_c,
            energy_j: 0.0,
            revolutions: 0.0,
            pi_integral: 0.0,
            ticks: 0,
        }
    }

    pub fn speed_rpm(&self) -> f64 {
        self.speed_rad_s / RAD_S_PER_RPM
    }

    /// Angular momentum in N·m·s.
    pub fn momentum_nms(&self, params: &WheelParams) -> f64 {
        params.inertia_kgm2 * self.speed_rad_s
    }

    pub fn uptime_ms(&self) -> u64 {
        self.ticks * TICK_PERIOD_MS
    }
}

impl Default for WheelState {
    fn default() -> Self {
        Self::new(&WheelParams::default())
    }
}

/// Everything the integrator needs from the control registers for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveInput {
    pub mode: ControlMode,
    pub direction: Direction,
    /// Setpoint in the mode's engineering unit: A, rpm, mN·m or percent.
    pub setpoint: f64,
    pub current_limit_a: f64,
    pub speed_kp: f64,
    pub speed_ki: f64,
    /// False while any protection latch is set.
    pub output_enabled: bool,
}

impl Default for DriveInput {
    fn default() -> Self {
        Self {
            mode: ControlMode::Idle,
            direction: Direction::Positive,
            setpoint: 0.0,
            current_limit_a: 5.0,
            speed_kp: 0.02,
            speed_ki: 0.2,
            output_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClampQuantity {
    SpeedRpm,
    CurrentA,
    BusVoltageV,
    MotorTempC,
}

impl ClampQuantity {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "speed_rpm" => Some(Self::SpeedRpm),
            "current_a" => Some(Self::CurrentA),
            "bus_voltage_v" => Some(Self::BusVoltageV),
            "motor_temp_c" => Some(Self::MotorTempC),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SpeedRpm => "speed_rpm",
            Self::CurrentA => "current_a",
            Self::BusVoltageV => "bus_voltage_v",
            Self::MotorTempC => "motor_temp_c",
        }
    }
}

/// A scenario override pinning one physical quantity to a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsClamp {
    pub quantity: ClampQuantity,
    pub value: f64,
}

impl PhysicsClamp {
    pub fn apply(&self, state: &mut WheelState) {
        match self.quantity {
            ClampQuantity::SpeedRpm => state.speed_rad_s = self.value * RAD_S_PER_RPM,
            ClampQuantity::CurrentA => state.current_a = self.value,
            ClampQuantity::BusVoltageV => state.bus_voltage_v = self.value,
            ClampQuantity::MotorTempC => state.motor_temp_c = self.value,
        }
    }
}

/// Advance the wheel by one fixed step.
#[must_use]
pub fn integrate(state: &WheelState, input: &DriveInput, params: &WheelParams) -> WheelState {
    let mut next = *state;
    let omega = state.speed_rad_s;

    // Drive stage
    let drive = motor::drive(state, input, params);
    next.pi_integral = drive.pi_integral;
    next.current_cmd_a = drive.current_cmd_a;
    next.current_a = drive.current_a;
    next.applied_voltage_v = drive.applied_voltage_v;

    // Mechanical
    next.motor_torque_nm = params.torque_constant_nm_a * drive.current_a;
    let loss = motor::loss_torque(omega, drive.current_a, params);
    let alpha = (next.motor_torque_nm - loss) / params.inertia_kgm2;
    let mut omega_next = omega + alpha * DT_S;

    // Static friction holds an undriven wheel instead of letting the
    // coulomb term flip its sign every step.
    let friction_step = (loss * DT_S / params.inertia_kgm2).abs();
    if drive.current_a == 0.0 && omega.abs() <= friction_step {
        omega_next = 0.0;
    }
    next.speed_rad_s = omega_next;

    // Electrical
    let electrical = power::step(state, drive.current_a, drive.applied_voltage_v, params);
    next.power_w = electrical.power_w;
    next.bus_voltage_v = electrical.bus_voltage_v;
    next.duty = electrical.duty;
    next.energy_j = state.energy_j + electrical.power_w.abs() * DT_S;
    next.revolutions = state.revolutions + omega_next.abs() * DT_S / core::f64::consts::TAU;

    // Thermal
    let temps = thermal::step(state, drive.current_a, electrical.power_w, params);
    next.motor_temp_c = temps.motor_c;
    next.driver_temp_c = temps.driver_c;

    next.ticks = state.ticks + 1;
    next
}

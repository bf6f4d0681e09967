//! Drive electronics and motor: control-mode selection, the speed PI loop and
//! the loss torque model.

use super::{ControlMode, DriveInput, WheelParams, WheelState, DT_S, RAD_S_PER_RPM};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveOutput {
    /// Current the active mode asked for before limiting.
    pub current_cmd_a: f64,
    /// Current actually delivered to the winding.
    pub current_a: f64,
    pub applied_voltage_v: f64,
    pub pi_integral: f64,
}

/// Sign of `x`, with zero mapping to zero.
pub fn signum0(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn clamp_symmetric(value: f64, limit: f64) -> f64 {
    value.clamp(-limit, limit)
}

pub fn drive(state: &WheelState, input: &DriveInput, params: &WheelParams) -> DriveOutput {
    if !input.output_enabled || input.mode == ControlMode::Idle {
        return DriveOutput {
            current_cmd_a: 0.0,
            current_a: 0.0,
            applied_voltage_v: 0.0,
            pi_integral: 0.0,
        };
    }

    let omega = state.speed_rad_s;
    let limit = input.current_limit_a.max(0.0);
    let sign = input.direction.sign();
    let back_emf = params.torque_constant_nm_a * omega;
    let mut pi_integral = state.pi_integral;

    let (current_cmd_a, current_a, applied_voltage_v) = match input.mode {
        ControlMode::Current => {
            let cmd = sign * input.setpoint;
            let i = clamp_symmetric(cmd, limit);
            (cmd, i, i * params.winding_resistance_ohm + back_emf)
        }
        ControlMode::Torque => {
            let cmd = sign * input.setpoint / 1000.0 / params.torque_constant_nm_a;
            let i = clamp_symmetric(cmd, limit);
            (cmd, i, i * params.winding_resistance_ohm + back_emf)
        }
        ControlMode::Pwm => {
            let v = sign * (input.setpoint / 100.0) * state.bus_voltage_v;
            let cmd = (v - back_emf) / params.winding_resistance_ohm;
            (cmd, clamp_symmetric(cmd, limit), v)
        }
        ControlMode::Speed => {
            let error = sign * input.setpoint * RAD_S_PER_RPM - omega;
            let raw = input.speed_kp * error + input.speed_ki * pi_integral;
            let i = clamp_symmetric(raw, limit);
            // Anti-windup: freeze the integral while saturated.
            if i == raw {
                pi_integral += error * DT_S;
            }
            (raw, i, i * params.winding_resistance_ohm + back_emf)
        }
        ControlMode::Idle => (0.0, 0.0, 0.0),
    };

    DriveOutput {
        current_cmd_a,
        current_a,
        applied_voltage_v,
        pi_integral,
    }
}

/// Viscous, coulomb and copper-loss drag, always opposing rotation.
pub fn loss_torque(omega: f64, current_a: f64, params: &WheelParams) -> f64 {
    let direction = signum0(omega);
    let copper_w = current_a * current_a * params.winding_resistance_ohm;
    params.viscous_friction_nms * omega
        + params.coulomb_friction_nm * direction
        + params.copper_loss_nm_w * copper_w * direction
}

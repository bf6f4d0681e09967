//! Lumped first-order thermal nodes for the motor winding and driver stage.

use super::{WheelParams, WheelState, DT_S};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperatures {
    pub motor_c: f64,
    pub driver_c: f64,
}

fn node_step(temp_c: f64, heat_w: f64, ambient_c: f64, r_th: f64, c_th: f64) -> f64 {
    let conducted_w = (temp_c - ambient_c) / r_th;
    temp_c + (heat_w - conducted_w) / c_th * DT_S
}

pub fn step(state: &WheelState, current_a: f64, power_w: f64, params: &WheelParams) -> Temperatures {
    let copper_w = current_a * current_a * params.winding_resistance_ohm;
    let driver_w = power_w.abs() * params.driver_loss_fraction;

    Temperatures {
        motor_c: node_step(
            state.motor_temp_c,
            copper_w,
            params.ambient_temp_c,
            params.motor_thermal_resistance_k_w,
            params.motor_thermal_capacitance_j_k,
        ),
        driver_c: node_step(
            state.driver_temp_c,
            driver_w,
            params.ambient_temp_c,
            params.driver_thermal_resistance_k_w,
            params.driver_thermal_capacitance_j_k,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heating_under_load() {
        let params = WheelParams::default();
        let temps = step(&WheelState::new(&params), 2.0, 30.0, &params);
        // 4.8 W into 40 J/K for 10 ms
        assert!((temps.motor_c - (20.0 + 4.8 / 40.0 * DT_S)).abs() < 1e-12);
        assert!(temps.driver_c > 20.0);
    }

    #[test]
    fn test_cooling_towards_ambient() {
        let params = WheelParams::default();
        let mut state = WheelState::new(&params);
        state.motor_temp_c = 80.0;
        let temps = step(&state, 0.0, 0.0, &params);
        assert!(temps.motor_c < 80.0);
        assert!(temps.motor_c > params.ambient_temp_c);
    }
}

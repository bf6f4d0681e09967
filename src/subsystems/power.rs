//! Supply bus seen by the wheel: electrical power, bus droop and duty cycle.

use super::{WheelParams, WheelState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectricalStep {
    pub power_w: f64,
    pub bus_voltage_v: f64,
    /// Fraction of the bus voltage applied to the winding, 0..
    pub duty: f64,
}

pub fn step(
    state: &WheelState,
    current_a: f64,
    applied_voltage_v: f64,
    params: &WheelParams,
) -> ElectricalStep {
    let power_w = applied_voltage_v * current_a;
    let nominal = params.bus_voltage_nominal_v;

    // Positive draw sags the bus, regeneration lifts it.
    let supply_current_a = power_w / nominal;
    let bus_voltage_v = nominal - supply_current_a * params.source_resistance_ohm;

    let duty = if state.bus_voltage_v > 0.0 {
        applied_voltage_v.abs() / state.bus_voltage_v
    } else {
        0.0
    };

    ElectricalStep {
        power_w,
        bus_voltage_v,
        duty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motoring_droops_bus() {
        let params = WheelParams::default();
        let out = step(&WheelState::new(&params), 2.0, 14.0, &params);
        assert!((out.power_w - 28.0).abs() < 1e-12);
        assert!((out.bus_voltage_v - (28.0 - 0.15)).abs() < 1e-12);
        assert!((out.duty - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_regeneration_raises_bus() {
        let params = WheelParams::default();
        let out = step(&WheelState::new(&params), -2.0, 14.0, &params);
        assert!(out.power_w < 0.0);
        assert!(out.bus_voltage_v > params.bus_voltage_nominal_v);
    }

    #[test]
    fn test_idle_bridge_draws_nothing() {
        let params = WheelParams::default();
        let out = step(&WheelState::new(&params), 0.0, 0.0, &params);
        assert_eq!(out.power_w, 0.0);
        assert_eq!(out.duty, 0.0);
        assert_eq!(out.bus_voltage_v, params.bus_voltage_nominal_v);
    }
}

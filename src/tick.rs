//! The physics-tick context.
//!
//! Owns the wheel state and the protection system. Each tick reads the
//! command mailbox, integrates, runs protection and publishes a snapshot;
//! nothing else in the crate touches these values directly.

use crate::channel::{PhysicsEndpoint, RING_CAPACITY};
use crate::io::MonotonicClock;
use crate::protection::{
    FaultKind, Measurements, ProtectionConfig, ProtectionState, ProtectionSystem,
};
use crate::subsystems::{
    integrate, ControlMode, Direction, DriveInput, PhysicsClamp, WheelParams, WheelState,
    TICK_PERIOD_MS,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const TICK_PERIOD_US: u64 = TICK_PERIOD_MS * 1000;

/// The desired control configuration, written by the comms context.
///
/// Clear and trip requests are edge-triggered by their sequence numbers:
/// the physics side acts once per new sequence and echoes it back in the
/// snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub mode: ControlMode,
    pub direction: Direction,
    pub setpoint: f64,
    pub speed_kp: f64,
    pub speed_ki: f64,
    pub protection: ProtectionConfig,
    pub clear_seq: u32,
    pub clear_mask: u32,
    pub trip_seq: u32,
    pub trip_mask: u32,
    pub clamp: Option<PhysicsClamp>,
}

impl Default for ControlCommand {
    fn default() -> Self {
        let drive = DriveInput::default();
        Self {
            mode: drive.mode,
            direction: drive.direction,
            setpoint: drive.setpoint,
            speed_kp: drive.speed_kp,
            speed_ki: drive.speed_ki,
            protection: ProtectionConfig::default(),
            clear_seq: 0,
            clear_mask: 0,
            trip_seq: 0,
            trip_mask: 0,
            clamp: None,
        }
    }
}

impl ControlCommand {
    fn drive_input(&self, output_enabled: bool) -> DriveInput {
        DriveInput {
            mode: self.mode,
            direction: self.direction,
            setpoint: self.setpoint,
            current_limit_a: self.protection.current_limit_a,
            speed_kp: self.speed_kp,
            speed_ki: self.speed_ki,
            output_enabled,
        }
    }
}

/// Immutable view of the wheel published every tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelSnapshot {
    pub state: WheelState,
    pub momentum_nms: f64,
    pub mode: ControlMode,
    pub protection: ProtectionState,
    pub clear_ack: u32,
    pub trip_ack: u32,
    pub overruns: u32,
    pub max_jitter_us: u32,
    pub uptime_ms: u64,
}

impl WheelSnapshot {
    pub fn initial(params: &WheelParams) -> Self {
        Self {
            state: WheelState::new(params),
            momentum_nms: 0.0,
            mode: ControlMode::Idle,
            protection: ProtectionState::default(),
            clear_ack: 0,
            trip_ack: 0,
            overruns: 0,
            max_jitter_us: 0,
            uptime_ms: 0,
        }
    }
}

impl Default for WheelSnapshot {
    fn default() -> Self {
        Self::initial(&WheelParams::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickStats {
    pub ticks: u64,
    pub overruns: u32,
    pub max_jitter_us: u32,
    pub last_duration_us: u32,
    pub dropped_snapshots: u32,
}

pub struct PhysicsContext<const N: usize = RING_CAPACITY> {
    params: WheelParams,
    state: WheelState,
    protection: ProtectionSystem,
    command: ControlCommand,
    clear_ack: u32,
    trip_ack: u32,
    endpoint: PhysicsEndpoint<ControlCommand, WheelSnapshot, N>,
    stats: TickStats,
    last_start_us: Option<u64>,
}

impl<const N: usize> PhysicsContext<N> {
    pub fn new(params: WheelParams, endpoint: PhysicsEndpoint<ControlCommand, WheelSnapshot, N>) -> Self {
        let command = endpoint.command();
        Self {
            params,
            state: WheelState::new(&params),
            protection: ProtectionSystem::new(command.protection),
            clear_ack: command.clear_seq,
            trip_ack: command.trip_seq,
            command,
            endpoint,
            stats: TickStats::default(),
            last_start_us: None,
        }
    }

    /// Run one 10 ms tick, timing it against `clock`.
    pub fn tick<C: MonotonicClock + ?Sized>(&mut self, clock: &C) -> WheelSnapshot {
        let start = clock.now_us();
        if let Some(last) = self.last_start_us {
            let interval = start.saturating_sub(last);
            let jitter = interval.abs_diff(TICK_PERIOD_US);
            self.stats.max_jitter_us = self
                .stats
                .max_jitter_us
                .max(u32::try_from(jitter).unwrap_or(u32::MAX));
        }
        self.last_start_us = Some(start);

        let snapshot = self.step();

        let duration = clock.now_us().saturating_sub(start);
        self.stats.last_duration_us = u32::try_from(duration).unwrap_or(u32::MAX);
        if duration > TICK_PERIOD_US {
            self.stats.overruns = self.stats.overruns.wrapping_add(1);
            debug!(duration_us = duration, "physics tick overran its period");
        }
        snapshot
    }

    /// Command intake, integration, protection and publish, untimed.
    pub fn step(&mut self) -> WheelSnapshot {
        if let Some(command) = self.endpoint.command_update() {
            self.apply_command(command);
        }

        let input = self
            .command
            .drive_input(self.protection.state().output_enabled());
        self.state = integrate(&self.state, &input, &self.params);
        if let Some(clamp) = self.command.clamp {
            clamp.apply(&mut self.state);
        }

        self.protection
            .evaluate(&Measurements::from_state(&self.state));

        self.stats.ticks = self.state.ticks;
        let snapshot = self.snapshot();
        if !self.endpoint.publish(snapshot) {
            self.stats.dropped_snapshots = self.stats.dropped_snapshots.wrapping_add(1);
        }
        snapshot
    }

    fn apply_command(&mut self, command: ControlCommand) {
        self.protection.set_config(command.protection);

        // Trips before clears: a clear that follows a trip within one period
        // must see the latch. The model strips tripped bits from any clear
        // that was queued ahead of the trip.
        if command.trip_seq != self.trip_ack {
            for kind in FaultKind::ALL {
                if command.trip_mask & kind.bit() != 0 {
                    self.protection.force_trip(kind);
                }
            }
            self.trip_ack = command.trip_seq;
        }

        if command.clear_seq != self.clear_ack {
            // Refused bits stay latched; the comms side already reported them.
            let _ = self.protection.clear(command.clear_mask);
            self.clear_ack = command.clear_seq;
        }

        self.command = command;
    }

    pub fn snapshot(&self) -> WheelSnapshot {
        WheelSnapshot {
            state: self.state,
            momentum_nms: self.state.momentum_nms(&self.params),
            mode: self.command.mode,
            protection: *self.protection.state(),
            clear_ack: self.clear_ack,
            trip_ack: self.trip_ack,
            overruns: self.stats.overruns,
            max_jitter_us: self.stats.max_jitter_us,
            uptime_ms: self.state.uptime_ms(),
        }
    }

    pub fn state(&self) -> &WheelState {
        &self.state
    }

    pub fn protection(&self) -> &ProtectionState {
        self.protection.state()
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn params(&self) -> &WheelParams {
        &self.params
    }
}

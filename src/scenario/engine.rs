use super::{EventAction, Scenario, ScenarioError, MAX_EVENTS};
use crate::protection::FaultKind;
use crate::subsystems::{ClampQuantity, PhysicsClamp};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Upper bound on hook commands produced by one `update`.
pub const MAX_HOOK_COMMANDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioState {
    Unloaded,
    Loaded,
    Armed,
    Running,
    Completed,
    Aborted,
}

/// What the device must do to its layers in response to the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookCommand {
    CorruptCrc { count: u32 },
    DropFrames { count: u32 },
    DuplicateFrames { count: u32 },
    DelayFrames { count: u32, delay_ms: u32 },
    ForceRegister { address: u16, value: u32 },
    ReleaseRegister { address: u16 },
    ForceTrip { fault: FaultKind },
    Clamp(PhysicsClamp),
    ReleaseClamp { quantity: ClampQuantity },
}

impl HookCommand {
    /// Hooks that expire by consuming outgoing frames rather than by time.
    pub fn is_counted(&self) -> bool {
        matches!(
            self,
            HookCommand::CorruptCrc { .. }
                | HookCommand::DropFrames { .. }
                | HookCommand::DuplicateFrames { .. }
                | HookCommand::DelayFrames { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimedTarget {
    Register(u16),
    Clamp(ClampQuantity),
}

#[derive(Debug, Clone, Copy)]
struct TimedEffect {
    target: TimedTarget,
    expires_at_ms: u64,
}

impl TimedEffect {
    fn revert(&self) -> HookCommand {
        match self.target {
            TimedTarget::Register(address) => HookCommand::ReleaseRegister { address },
            TimedTarget::Clamp(quantity) => HookCommand::ReleaseClamp { quantity },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiredEvent {
    pub index: usize,
    pub offset_ms: u32,
    pub fired_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioStats {
    pub runs: u32,
    pub events_fired: u32,
    pub effects_reverted: u32,
    pub aborted_runs: u32,
}

#[derive(Debug)]
pub struct ScenarioEngine {
    scenario: Option<Scenario>,
    state: ScenarioState,
    started_at_ms: u64,
    cursor: usize,
    // Each event adds at most one timed effect.
    timed: Vec<TimedEffect, MAX_EVENTS>,
    fired: Vec<FiredEvent, MAX_EVENTS>,
    stats: ScenarioStats,
}

impl ScenarioEngine {
    pub fn new() -> Self {
        Self {
            scenario: None,
            state: ScenarioState::Unloaded,
            started_at_ms: 0,
            cursor: 0,
            timed: Vec::new(),
            fired: Vec::new(),
            stats: ScenarioStats::default(),
        }
    }

    pub fn load(&mut self, scenario: Scenario) -> Result<(), ScenarioError> {
        if self.is_active() {
            return Err(self.transition_error("load"));
        }
        info!(
            name = scenario.name.as_str(),
            events = scenario.events.len(),
            "scenario loaded"
        );
        self.scenario = Some(scenario);
        self.reset_run();
        self.state = ScenarioState::Loaded;
        Ok(())
    }

    /// Parse, validate and load in one step. A failed parse leaves the
    /// previous scenario untouched.
    pub fn load_json(&mut self, text: &str) -> Result<(), ScenarioError> {
        if self.is_active() {
            return Err(self.transition_error("load"));
        }
        let scenario = Scenario::from_json(text)?;
        self.load(scenario)
    }

    /// Prepare a loaded scenario to run. Finished scenarios can be re-armed.
    pub fn arm(&mut self) -> Result<(), ScenarioError> {
        match self.state {
            ScenarioState::Loaded | ScenarioState::Completed | ScenarioState::Aborted => {
                self.reset_run();
                self.state = ScenarioState::Armed;
                debug!("scenario armed");
                Ok(())
            }
            _ => Err(self.transition_error("arm")),
        }
    }

    /// Start the timeline at `now_ms`.
    pub fn start(&mut self, now_ms: u64) -> Result<(), ScenarioError> {
        if self.state != ScenarioState::Armed {
            return Err(self.transition_error("start"));
        }
        self.started_at_ms = now_ms;
        self.state = ScenarioState::Running;
        self.stats.runs += 1;
        info!(at_ms = now_ms, "scenario started");
        Ok(())
    }

    /// Advance the timeline. Call once per communications-loop iteration.
    ///
    /// `hooks_pending` reports whether any count-based hook (CRC corruption,
    /// frame drop, duplicate or delay) still has frames left to act on. The
    /// run is not complete while it does.
    pub fn update(
        &mut self,
        now_ms: u64,
        hooks_pending: bool,
    ) -> Vec<HookCommand, MAX_HOOK_COMMANDS> {
        let mut commands = Vec::new();
        if self.state != ScenarioState::Running {
            return commands;
        }

        self.expire_effects(now_ms, &mut commands);
        self.fire_due_events(now_ms, &mut commands);

        let all_fired = self
            .scenario
            .as_ref()
            .map_or(true, |s| self.cursor >= s.events.len());
        let counts_armed = hooks_pending || commands.iter().any(HookCommand::is_counted);
        if all_fired && self.timed.is_empty() && !counts_armed {
            self.state = ScenarioState::Completed;
            info!(
                elapsed_ms = self.elapsed_ms(now_ms),
                fired = self.fired.len(),
                "scenario completed"
            );
        }
        commands
    }

    fn expire_effects(&mut self, now_ms: u64, commands: &mut Vec<HookCommand, MAX_HOOK_COMMANDS>) {
        let mut i = 0;
        while i < self.timed.len() {
            let effect = self.timed[i];
            if effect.expires_at_ms > now_ms {
                i += 1;
                continue;
            }
            if commands.push(effect.revert()).is_err() {
                // Command buffer full, revert on the next poll.
                return;
            }
            self.timed.swap_remove(i);
            self.stats.effects_reverted += 1;
            debug!(target_effect = ?effect.target, "timed effect reverted");
        }
    }

    fn fire_due_events(&mut self, now_ms: u64, commands: &mut Vec<HookCommand, MAX_HOOK_COMMANDS>) {
        let Some(scenario) = self.scenario.as_ref() else {
            return;
        };
        let elapsed = now_ms.saturating_sub(self.started_at_ms);

        while let Some(event) = scenario.events.get(self.cursor) {
            if u64::from(event.offset_ms) > elapsed || commands.is_full() {
                break;
            }

            let command = match event.action {
                EventAction::CorruptCrc { count } => HookCommand::CorruptCrc { count },
                EventAction::DropFrames { count } => HookCommand::DropFrames { count },
                EventAction::DuplicateFrames { count } => HookCommand::DuplicateFrames { count },
                EventAction::DelayFrames { count, delay_ms } => {
                    HookCommand::DelayFrames { count, delay_ms }
                }
                EventAction::StuckRegister { address, value, .. } => {
                    HookCommand::ForceRegister { address, value }
                }
                EventAction::ForceTrip { fault } => HookCommand::ForceTrip { fault },
                EventAction::ClampPhysics { clamp, .. } => HookCommand::Clamp(clamp),
            };
            let timed_target = match event.action {
                EventAction::StuckRegister { address, .. } => Some(TimedTarget::Register(address)),
                EventAction::ClampPhysics { clamp, .. } => Some(TimedTarget::Clamp(clamp.quantity)),
                _ => None,
            };
            if let (Some(target), Some(duration_ms)) = (timed_target, event.action.duration_ms()) {
                let expires_at_ms = now_ms + u64::from(duration_ms);
                // Only one clamp is applied at a time; a newer one replaces it.
                self.timed.retain(|t| match (t.target, target) {
                    (TimedTarget::Clamp(_), TimedTarget::Clamp(_)) => false,
                    (a, b) => a != b,
                });
                let _ = self.timed.push(TimedEffect {
                    target,
                    expires_at_ms,
                });
            }

            let _ = commands.push(command);
            let _ = self.fired.push(FiredEvent {
                index: self.cursor,
                offset_ms: event.offset_ms,
                fired_at_ms: now_ms,
            });
            self.stats.events_fired += 1;
            info!(
                target_layer = event.action.target().name(),
                action = event.action.action_name(),
                offset_ms = event.offset_ms,
                elapsed_ms = elapsed,
                "scenario event fired"
            );
            self.cursor += 1;
        }
    }

    /// Abort the run. The caller clears every hook; the engine forgets its
    /// timed effects without emitting reverts.
    pub fn deactivate(&mut self) {
        if self.is_active() {
            self.state = ScenarioState::Aborted;
            self.stats.aborted_runs += 1;
            info!(fired = self.fired.len(), "scenario aborted");
        }
        self.timed.clear();
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ScenarioState::Armed | ScenarioState::Running)
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn scenario(&self) -> Option<&Scenario> {
        self.scenario.as_ref()
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            ScenarioState::Running | ScenarioState::Completed | ScenarioState::Aborted => {
                now_ms.saturating_sub(self.started_at_ms)
            }
            _ => 0,
        }
    }

    pub fn fired(&self) -> &[FiredEvent] {
        &self.fired
    }

    pub fn pending_effects(&self) -> usize {
        self.timed.len()
    }

    pub fn stats(&self) -> &ScenarioStats {
        &self.stats
    }

    fn reset_run(&mut self) {
        self.cursor = 0;
        self.timed.clear();
        self.fired.clear();
        self.started_at_ms = 0;
    }

    fn transition_error(&self, op: &'static str) -> ScenarioError {
        ScenarioError::InvalidTransition {
            op,
            state: self.state,
        }
    }
}

impl Default for ScenarioEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMELINE: &str = r#"{
        "name": "timeline",
        "events": [
            {"offset_ms": 500, "target": "crc", "action": "corrupt", "params": {"count": 1}},
            {"offset_ms": 1500, "target": "slip", "action": "drop", "params": {"count": 1}},
            {"offset_ms": 1500, "target": "register", "action": "stuck",
             "params": {"address": 768, "value": 256, "duration_ms": 100}}
        ]
    }"#;

    fn running(now_ms: u64) -> ScenarioEngine {
        let mut engine = ScenarioEngine::new();
        engine.load_json(TIMELINE).unwrap();
        engine.arm().unwrap();
        engine.start(now_ms).unwrap();
        engine
    }

    #[test]
    fn test_state_transitions() {
        let mut engine = ScenarioEngine::new();
        assert_eq!(engine.state(), ScenarioState::Unloaded);
        assert!(matches!(
            engine.arm(),
            Err(ScenarioError::InvalidTransition { op: "arm", .. })
        ));
        engine.load_json(TIMELINE).unwrap();
        assert!(engine.start(0).is_err());
        engine.arm().unwrap();
        assert!(engine.load_json(TIMELINE).is_err());
        engine.start(0).unwrap();
        assert_eq!(engine.state(), ScenarioState::Running);
    }

    #[test]
    fn test_events_fire_once_in_order() {
        let mut engine = running(1000);
        assert!(engine.update(1499, false).is_empty());
        assert_eq!(
            engine.update(1500, false).as_slice(),
            &[HookCommand::CorruptCrc { count: 1 }]
        );
        assert!(engine.update(1600, false).is_empty());

        let both = engine.update(2600, false);
        assert_eq!(
            both.as_slice(),
            &[
                HookCommand::DropFrames { count: 1 },
                HookCommand::ForceRegister {
                    address: 0x0300,
                    value: 256
                }
            ]
        );
        assert_eq!(engine.fired().len(), 3);
        assert_eq!(engine.state(), ScenarioState::Running);
        assert_eq!(engine.pending_effects(), 1);
    }

    #[test]
    fn test_completes_after_timed_effects_revert() {
        let mut engine = running(0);
        engine.update(1500, false);
        assert_eq!(engine.state(), ScenarioState::Running);
        assert!(engine.update(1599, false).is_empty());
        assert_eq!(
            engine.update(1600, false).as_slice(),
            &[HookCommand::ReleaseRegister { address: 0x0300 }]
        );
        assert_eq!(engine.state(), ScenarioState::Completed);
        assert_eq!(engine.stats().effects_reverted, 1);
        assert!(engine.update(5000, false).is_empty());
    }

    #[test]
    fn test_waits_for_counted_hooks_to_drain() {
        let text = r#"{"name": "late-corrupt", "events": [
            {"offset_ms": 100, "target": "crc", "action": "corrupt", "params": {"count": 3}}
        ]}"#;
        let mut engine = ScenarioEngine::new();
        engine.load_json(text).unwrap();
        engine.arm().unwrap();
        engine.start(0).unwrap();

        assert_eq!(
            engine.update(100, false).as_slice(),
            &[HookCommand::CorruptCrc { count: 3 }]
        );
        assert_eq!(engine.state(), ScenarioState::Running);
        assert!(engine.update(200, true).is_empty());
        assert_eq!(engine.state(), ScenarioState::Running);
        engine.update(300, false);
        assert_eq!(engine.state(), ScenarioState::Completed);
    }

    #[test]
    fn test_deactivate_aborts_and_forgets_effects() {
        let mut engine = running(0);
        engine.update(1500, false);
        engine.deactivate();
        assert_eq!(engine.state(), ScenarioState::Aborted);
        assert_eq!(engine.pending_effects(), 0);
        assert!(engine.update(2000, false).is_empty());

        engine.arm().unwrap();
        engine.start(10_000).unwrap();
        assert_eq!(engine.update(10_500, false).len(), 1);
        assert_eq!(engine.stats().runs, 2);
        assert_eq!(engine.stats().aborted_runs, 1);
    }

    #[test]
    fn test_newer_clamp_replaces_older() {
        let text = r#"{"name": "clamps", "events": [
            {"offset_ms": 0, "target": "physics", "action": "clamp",
             "params": {"quantity": "speed_rpm", "value": 100, "duration_ms": 1000}},
            {"offset_ms": 10, "target": "physics", "action": "clamp",
             "params": {"quantity": "motor_temp_c", "value": 90, "duration_ms": 20}}
        ]}"#;
        let mut engine = ScenarioEngine::new();
        engine.load_json(text).unwrap();
        engine.arm().unwrap();
        engine.start(0).unwrap();
        engine.update(0, false);
        engine.update(10, false);
        assert_eq!(engine.pending_effects(), 1);
        assert_eq!(
            engine.update(30, false).as_slice(),
            &[HookCommand::ReleaseClamp {
                quantity: ClampQuantity::MotorTempC
            }]
        );
        assert_eq!(engine.state(), ScenarioState::Completed);
    }
}

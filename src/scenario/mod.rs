//! Timeline-driven fault injection.
//!
//! A scenario is a list of events `{offset_ms, target, action, params}`
//! loaded from the JSON subset handled by [`json`]. The [`engine`] turns the
//! timeline into hook commands the device applies to its CRC, framing,
//! register, protection and physics layers.

pub mod engine;
pub mod json;

pub use engine::{HookCommand, ScenarioEngine, ScenarioState, ScenarioStats};

use crate::protection::FaultKind;
use crate::registers;
use crate::subsystems::{ClampQuantity, PhysicsClamp};
use arrayvec::ArrayString;
use heapless::Vec;
use json::{Json, JsonError};
use thiserror::Error;

pub const MAX_EVENTS: usize = 32;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_DESCRIPTION_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Crc,
    Slip,
    Register,
    Protection,
    Physics,
}

impl Target {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "crc" => Some(Self::Crc),
            "slip" => Some(Self::Slip),
            "register" => Some(Self::Register),
            "protection" => Some(Self::Protection),
            "physics" => Some(Self::Physics),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Crc => "crc",
            Self::Slip => "slip",
            Self::Register => "register",
            Self::Protection => "protection",
            Self::Physics => "physics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventAction {
    CorruptCrc { count: u32 },
    DropFrames { count: u32 },
    DuplicateFrames { count: u32 },
    DelayFrames { count: u32, delay_ms: u32 },
    StuckRegister { address: u16, value: u32, duration_ms: u32 },
    ForceTrip { fault: FaultKind },
    ClampPhysics { clamp: PhysicsClamp, duration_ms: u32 },
}

impl EventAction {
    pub fn target(&self) -> Target {
        match self {
            Self::CorruptCrc { .. } => Target::Crc,
            Self::DropFrames { .. } | Self::DuplicateFrames { .. } | Self::DelayFrames { .. } => {
                Target::Slip
            }
            Self::StuckRegister { .. } => Target::Register,
            Self::ForceTrip { .. } => Target::Protection,
            Self::ClampPhysics { .. } => Target::Physics,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            Self::CorruptCrc { .. } => "corrupt",
            Self::DropFrames { .. } => "drop",
            Self::DuplicateFrames { .. } => "duplicate",
            Self::DelayFrames { .. } => "delay",
            Self::StuckRegister { .. } => "stuck",
            Self::ForceTrip { .. } => "trip",
            Self::ClampPhysics { .. } => "clamp",
        }
    }

    /// How long the effect stays applied, for effects bounded by time.
    pub fn duration_ms(&self) -> Option<u32> {
        match *self {
            Self::StuckRegister { duration_ms, .. } | Self::ClampPhysics { duration_ms, .. } => {
                Some(duration_ms)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioEvent {
    pub offset_ms: u32,
    pub action: EventAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: ArrayString<MAX_NAME_LEN>,
    pub description: ArrayString<MAX_DESCRIPTION_LEN>,
    /// Sorted by `offset_ms`; equal offsets keep file order.
    pub events: Vec<ScenarioEvent, MAX_EVENTS>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("malformed scenario: {0}")]
    Json(#[from] JsonError),
    #[error("missing field `{field}` in object at byte {pos}")]
    MissingField { field: &'static str, pos: usize },
    #[error("field `{field}` must be {expected}, found {found} at byte {pos}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
        pos: usize,
    },
    #[error("`{field}` exceeds {max} bytes at byte {pos}")]
    TooLong {
        field: &'static str,
        max: usize,
        pos: usize,
    },
    #[error("more than {MAX_EVENTS} events at byte {pos}")]
    TooManyEvents { pos: usize },
    #[error("unknown target `{target}` at byte {pos}")]
    UnknownTarget { target: String, pos: usize },
    #[error("unknown action `{action}` for target `{target}` at byte {pos}")]
    UnknownAction {
        target: &'static str,
        action: String,
        pos: usize,
    },
    #[error("invalid parameter `{param}` at byte {pos}: {reason}")]
    InvalidParam {
        param: &'static str,
        reason: &'static str,
        pos: usize,
    },
    #[error("cannot {op} a scenario that is {state:?}")]
    InvalidTransition {
        op: &'static str,
        state: ScenarioState,
    },
}

impl Scenario {
    /// Parse and validate a scenario document. Nothing is returned unless
    /// the whole document is valid.
    pub fn from_json(text: &str) -> Result<Self, ScenarioError> {
        let root = json::parse(text)?;
        if !root.is_object() {
            return Err(wrong_type("scenario", "an object", &root));
        }

        let name = bounded_string::<MAX_NAME_LEN>(&root, "name")?;
        let description = match root.get("description") {
            Some(_) => bounded_string::<MAX_DESCRIPTION_LEN>(&root, "description")?,
            None => ArrayString::new(),
        };

        let events_json = required(&root, "events")?;
        let items = events_json
            .as_array()
            .ok_or_else(|| wrong_type("events", "an array", events_json))?;

        let mut events = Vec::new();
        for item in items {
            let event = parse_event(item)?;
            events
                .push(event)
                .map_err(|_| ScenarioError::TooManyEvents { pos: item.pos })?;
        }
        events.sort_by_key(|e: &ScenarioEvent| e.offset_ms);

        Ok(Self {
            name,
            description,
            events,
        })
    }

    /// Offset of the last event.
    pub fn span_ms(&self) -> u32 {
        self.events.last().map_or(0, |e| e.offset_ms)
    }
}

fn required<'a>(obj: &'a Json, field: &'static str) -> Result<&'a Json, ScenarioError> {
    obj.get(field)
        .ok_or(ScenarioError::MissingField { field, pos: obj.pos })
}

fn bounded_string<const N: usize>(
    obj: &Json,
    field: &'static str,
) -> Result<ArrayString<N>, ScenarioError> {
    let value = required(obj, field)?;
    let text = value.as_str().ok_or_else(|| wrong_type(field, "a string", value))?;
    ArrayString::from(text).map_err(|_| ScenarioError::TooLong {
        field,
        max: N,
        pos: value.pos,
    })
}

fn wrong_type(field: &'static str, expected: &'static str, value: &Json) -> ScenarioError {
    ScenarioError::WrongType {
        field,
        expected,
        found: value.type_name(),
        pos: value.pos,
    }
}

fn required_str<'a>(obj: &'a Json, field: &'static str) -> Result<(&'a str, usize), ScenarioError> {
    let value = required(obj, field)?;
    let text = value.as_str().ok_or_else(|| wrong_type(field, "a string", value))?;
    Ok((text, value.pos))
}

/// A non-negative integer no larger than `max`.
fn integer(obj: &Json, field: &'static str, max: u64) -> Result<u64, ScenarioError> {
    let value = required(obj, field)?;
    let n = value.as_f64().ok_or_else(|| wrong_type(field, "a number", value))?;
    if n.fract() != 0.0 || n < 0.0 {
        return Err(ScenarioError::InvalidParam {
            param: field,
            reason: "must be a non-negative integer",
            pos: value.pos,
        });
    }
    if n > max as f64 {
        return Err(ScenarioError::InvalidParam {
            param: field,
            reason: "out of range",
            pos: value.pos,
        });
    }
    Ok(n as u64)
}

fn u32_param(obj: &Json, field: &'static str) -> Result<u32, ScenarioError> {
    integer(obj, field, u64::from(u32::MAX)).map(|n| n as u32)
}

fn count_param(obj: &Json) -> Result<u32, ScenarioError> {
    let count = u32_param(obj, "count")?;
    if count == 0 {
        return Err(ScenarioError::InvalidParam {
            param: "count",
            reason: "must be at least 1",
            pos: required(obj, "count")?.pos,
        });
    }
    Ok(count)
}

fn parse_event(item: &Json) -> Result<ScenarioEvent, ScenarioError> {
    if !item.is_object() {
        return Err(wrong_type("events[]", "an object", item));
    }

    let offset_ms = u32_param(item, "offset_ms")?;
    let (target_name, target_pos) = required_str(item, "target")?;
    let target = Target::from_name(target_name).ok_or_else(|| ScenarioError::UnknownTarget {
        target: target_name.into(),
        pos: target_pos,
    })?;
    let (action, action_pos) = required_str(item, "action")?;

    let params = required(item, "params")?;
    if !params.is_object() {
        return Err(wrong_type("params", "an object", params));
    }

    let action = match (target, action) {
        (Target::Crc, "corrupt") => EventAction::CorruptCrc {
            count: count_param(params)?,
        },
        (Target::Slip, "drop") => EventAction::DropFrames {
            count: count_param(params)?,
        },
        (Target::Slip, "duplicate") => EventAction::DuplicateFrames {
            count: count_param(params)?,
        },
        (Target::Slip, "delay") => EventAction::DelayFrames {
            count: count_param(params)?,
            delay_ms: u32_param(params, "delay_ms")?,
        },
        (Target::Register, "stuck") => {
            let address = integer(params, "address", u64::from(u16::MAX))? as u16;
            if registers::lookup(address).is_none() {
                return Err(ScenarioError::InvalidParam {
                    param: "address",
                    reason: "no such register",
                    pos: required(params, "address")?.pos,
                });
            }
            EventAction::StuckRegister {
                address,
                value: u32_param(params, "value")?,
                duration_ms: u32_param(params, "duration_ms")?,
            }
        }
        (Target::Protection, "trip") => {
            let (name, pos) = required_str(params, "fault")?;
            let fault = FaultKind::from_name(name).ok_or(ScenarioError::InvalidParam {
                param: "fault",
                reason: "unknown fault name",
                pos,
            })?;
            EventAction::ForceTrip { fault }
        }
        (Target::Physics, "clamp") => {
            let (name, pos) = required_str(params, "quantity")?;
            let quantity = ClampQuantity::from_name(name).ok_or(ScenarioError::InvalidParam {
                param: "quantity",
                reason: "unknown physics quantity",
                pos,
            })?;
            let value_json = required(params, "value")?;
            let value = value_json
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| wrong_type("value", "a finite number", value_json))?;
            EventAction::ClampPhysics {
                clamp: PhysicsClamp { quantity, value },
                duration_ms: u32_param(params, "duration_ms")?,
            }
        }
        (target, other) => {
            return Err(ScenarioError::UnknownAction {
                target: target.name(),
                action: other.into(),
                pos: action_pos,
            })
        }
    };

    Ok(ScenarioEvent { offset_ms, action })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_EVENTS: &str = r#"{
        "name": "crc-then-drop",
        "description": "corrupt one reply, then drop one",
        "events": [
            {"offset_ms": 1500, "target": "slip", "action": "drop", "params": {"count": 1}},
            {"offset_ms": 500, "target": "crc", "action": "corrupt", "params": {"count": 1}}
        ]
    }"#;

    #[test]
    fn test_parse_sorts_events() {
        let scenario = Scenario::from_json(TWO_EVENTS).unwrap();
        assert_eq!(scenario.name.as_str(), "crc-then-drop");
        assert_eq!(scenario.events.len(), 2);
        assert_eq!(scenario.events[0].offset_ms, 500);
        assert_eq!(scenario.events[0].action, EventAction::CorruptCrc { count: 1 });
        assert_eq!(scenario.events[1].action, EventAction::DropFrames { count: 1 });
        assert_eq!(scenario.span_ms(), 1500);
    }

    #[test]
    fn test_parse_all_actions() {
        let text = r#"{"name": "all", "events": [
            {"offset_ms": 0, "target": "slip", "action": "duplicate", "params": {"count": 2}},
            {"offset_ms": 0, "target": "slip", "action": "delay", "params": {"count": 1, "delay_ms": 40}},
            {"offset_ms": 10, "target": "register", "action": "stuck", "params": {"address": 768, "value": 4096, "duration_ms": 100}},
            {"offset_ms": 20, "target": "protection", "action": "trip", "params": {"fault": "overvoltage"}},
            {"offset_ms": 30, "target": "physics", "action": "clamp", "params": {"quantity": "bus_voltage_v", "value": 40.5, "duration_ms": 50}}
        ]}"#;
        let scenario = Scenario::from_json(text).unwrap();
        assert_eq!(scenario.description.as_str(), "");
        assert_eq!(
            scenario.events[2].action,
            EventAction::StuckRegister {
                address: 0x0300,
                value: 4096,
                duration_ms: 100
            }
        );
        assert_eq!(scenario.events[4].action.duration_ms(), Some(50));
        assert_eq!(scenario.events[3].action.target(), Target::Protection);
    }

    #[test]
    fn test_missing_field_reports_object_position() {
        let err = Scenario::from_json(r#"{"events": []}"#).unwrap_err();
        assert_eq!(err, ScenarioError::MissingField { field: "name", pos: 0 });
    }

    #[test]
    fn test_wrong_type_names_what_was_found() {
        let err = Scenario::from_json(r#"{"name": "x", "events": {"offset_ms": 0}}"#).unwrap_err();
        assert_eq!(
            err,
            ScenarioError::WrongType {
                field: "events",
                expected: "an array",
                found: "object",
                pos: 24,
            }
        );
        assert_eq!(
            err.to_string(),
            "field `events` must be an array, found object at byte 24"
        );

        let err = Scenario::from_json(r#"{"name": true, "events": []}"#).unwrap_err();
        assert!(matches!(err, ScenarioError::WrongType { field: "name", found: "boolean", .. }));
    }

    #[test]
    fn test_unknown_target_position() {
        let text = r#"{"name": "x", "events": [{"offset_ms": 0, "target": "adc", "action": "x", "params": {}}]}"#;
        match Scenario::from_json(text).unwrap_err() {
            ScenarioError::UnknownTarget { target, pos } => {
                assert_eq!(target, "adc");
                assert_eq!(&text[pos..pos + 5], "\"adc\"");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_and_bad_params() {
        let bad_action = r#"{"name": "x", "events": [{"offset_ms": 0, "target": "crc", "action": "flip", "params": {}}]}"#;
        assert!(matches!(
            Scenario::from_json(bad_action),
            Err(ScenarioError::UnknownAction { target: "crc", .. })
        ));

        let zero_count = r#"{"name": "x", "events": [{"offset_ms": 0, "target": "crc", "action": "corrupt", "params": {"count": 0}}]}"#;
        assert!(matches!(
            Scenario::from_json(zero_count),
            Err(ScenarioError::InvalidParam { param: "count", .. })
        ));

        let bad_register = r#"{"name": "x", "events": [{"offset_ms": 0, "target": "register", "action": "stuck", "params": {"address": 2, "value": 1, "duration_ms": 1}}]}"#;
        assert!(matches!(
            Scenario::from_json(bad_register),
            Err(ScenarioError::InvalidParam { param: "address", .. })
        ));

        let negative = r#"{"name": "x", "events": [{"offset_ms": -5, "target": "crc", "action": "corrupt", "params": {"count": 1}}]}"#;
        assert!(matches!(
            Scenario::from_json(negative),
            Err(ScenarioError::InvalidParam { param: "offset_ms", .. })
        ));
    }

    #[test]
    fn test_json_errors_propagate() {
        let err = Scenario::from_json(r#"{"name": "x", "events": [null]}"#).unwrap_err();
        assert!(matches!(err, ScenarioError::Json(e) if e.pos == 25));
    }

    #[test]
    fn test_name_too_long() {
        let long = format!(r#"{{"name": "{}", "events": []}}"#, "n".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(
            Scenario::from_json(&long),
            Err(ScenarioError::TooLong { field: "name", .. })
        ));
    }
}

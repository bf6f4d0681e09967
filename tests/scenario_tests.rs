mod common;

use common::*;
use nspwheel::fixed::{FixedPoint, Q16_16};
use nspwheel::model::status_flags;
use nspwheel::protection::fault_bits;
use nspwheel::protocol::{Packet, ProtocolError, ReplyStatus};
use nspwheel::registers::addr;
use nspwheel::scenario::{Scenario, ScenarioError, ScenarioState};

const CRC_THEN_DROP: &str = r#"{
    "name": "crc-then-drop",
    "description": "one corrupted reply at 0.5 s, one lost reply at 1.5 s",
    "events": [
        {"offset_ms": 500, "target": "crc", "action": "corrupt", "params": {"count": 1}},
        {"offset_ms": 1500, "target": "slip", "action": "drop", "params": {"count": 1}}
    ]
}"#;

fn start(bench: &mut Bench, json: &str) {
    bench.device.load_scenario(json).unwrap();
    bench.device.start_scenario(bench.now_ms).unwrap();
}

/// Advance one tick and ping with `tag`; returns every frame written.
fn ping_tick(bench: &mut Bench, tag: &[u8]) -> Vec<Vec<u8>> {
    bench.wheel.step();
    bench.now_ms += TICK_MS;
    bench.send(0x00, tag);
    bench.poll();
    bench.frames()
}

#[test]
fn test_crc_then_drop_timeline() {
    let mut bench = Bench::new();
    start(&mut bench, CRC_THEN_DROP);
    assert_eq!(bench.device.scenario().state(), ScenarioState::Running);

    for _ in 0..200 {
        let tag = (bench.now_ms + TICK_MS).to_le_bytes();
        let frames = ping_tick(&mut bench, &tag);
        match bench.now_ms {
            500 => {
                assert_eq!(frames.len(), 1);
                assert!(matches!(
                    Packet::parse(&frames[0]),
                    Err(ProtocolError::CrcMismatch { .. })
                ));
            }
            1500 => assert!(frames.is_empty(), "reply at 1500 ms should be dropped"),
            _ => {
                assert_eq!(frames.len(), 1, "at {} ms", bench.now_ms);
                let reply = Packet::parse(&frames[0]).unwrap();
                assert_eq!(&reply.payload[1..], &tag);
            }
        }
    }

    assert_eq!(bench.device.scenario().state(), ScenarioState::Completed);
    let fired: Vec<u64> = bench
        .device
        .scenario()
        .fired()
        .iter()
        .map(|f| f.fired_at_ms)
        .collect();
    assert_eq!(fired, vec![500, 1500]);
    assert_eq!(bench.device.crc_engine().corrupted_total(), 1);
    assert_eq!(bench.device.stats().replies_dropped, 1);

    bench.tick();
    assert_eq!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::SCENARIO_ACTIVE, 0);
}

#[test]
fn test_delay_and_duplicate() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "late-and-twice", "events": [
            {"offset_ms": 0, "target": "slip", "action": "delay", "params": {"count": 1, "delay_ms": 40}},
            {"offset_ms": 100, "target": "slip", "action": "duplicate", "params": {"count": 1}}
        ]}"#,
    );

    assert!(ping_tick(&mut bench, b"a").is_empty());
    for _ in 0..3 {
        bench.tick();
        assert!(bench.frames().is_empty(), "released early at {} ms", bench.now_ms);
    }
    bench.tick();
    assert_eq!(bench.now_ms, 50);
    let frames = bench.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(Packet::parse(&frames[0]).unwrap().payload.as_slice(), b"\x00a");

    while bench.now_ms < 90 {
        bench.tick();
    }
    let frames = ping_tick(&mut bench, b"b");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], frames[1]);
    assert_eq!(bench.device.stats().replies_duplicated, 1);
}

#[test]
fn test_stuck_register_is_released() {
    let mut bench = Bench::new();
    assert_eq!(bench.app_command(1, 0, Q16_16::from_f64(2.0)), ReplyStatus::Ok);
    start(
        &mut bench,
        r#"{"name": "frozen-speed", "events": [
            {"offset_ms": 50, "target": "register", "action": "stuck",
             "params": {"address": 768, "value": 4096, "duration_ms": 100}}
        ]}"#,
    );

    bench.run(6);
    assert_eq!(bench.peek_u32(addr::SPEED_RPM), 4096);
    bench.tick();
    assert_ne!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::REGISTER_FORCED, 0);

    while bench.now_ms < 160 {
        bench.tick();
    }
    bench.tick();
    assert_ne!(bench.peek_u32(addr::SPEED_RPM), 4096);
    assert_eq!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::REGISTER_FORCED, 0);
    assert_eq!(bench.device.scenario().state(), ScenarioState::Completed);
}

#[test]
fn test_forced_trip_is_clearable() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "power-trip", "events": [
            {"offset_ms": 100, "target": "protection", "action": "trip", "params": {"fault": "overpower"}}
        ]}"#,
    );

    bench.run(11);
    assert_eq!(bench.device.model().snapshot().protection.latched, fault_bits::OVERPOWER);
    assert_eq!(bench.peek(addr::LAST_FAULT_CODE), vec![4]);

    let reply = bench.clear_fault(fault_bits::OVERPOWER);
    assert_eq!(status(&reply), ReplyStatus::Ok);
    bench.tick();
    assert_eq!(bench.device.model().snapshot().protection.latched, 0);
}

#[test]
fn test_physics_clamp_drives_protection() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "fake-overspeed", "events": [
            {"offset_ms": 0, "target": "physics", "action": "clamp",
             "params": {"quantity": "speed_rpm", "value": 7000.0, "duration_ms": 200}}
        ]}"#,
    );

    bench.run(3);
    let snap = *bench.device.model().snapshot();
    assert!((snap.state.speed_rpm() - 7000.0).abs() < 1e-6);
    assert_eq!(snap.protection.latched, fault_bits::OVERSPEED);
    assert_ne!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::CLAMP_ACTIVE, 0);

    bench.run(20);
    assert!(bench.device.model().command().clamp.is_none());
    assert_eq!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::CLAMP_ACTIVE, 0);
    assert!(bench.device.model().snapshot().state.speed_rpm() < 7000.0);
}

#[test]
fn test_deactivate_restores_every_hook() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "everything", "events": [
            {"offset_ms": 0, "target": "crc", "action": "corrupt", "params": {"count": 3}},
            {"offset_ms": 0, "target": "slip", "action": "delay", "params": {"count": 1, "delay_ms": 1000}},
            {"offset_ms": 0, "target": "register", "action": "stuck",
             "params": {"address": 1036, "value": 99, "duration_ms": 10000}},
            {"offset_ms": 0, "target": "physics", "action": "clamp",
             "params": {"quantity": "motor_temp_c", "value": 90.0, "duration_ms": 10000}}
        ]}"#,
    );

    assert!(ping_tick(&mut bench, b"1").is_empty());
    assert!(bench.device.model().registers().is_forced(addr::CRC_ERROR_COUNT));

    bench.device.deactivate_scenario();
    assert_eq!(bench.device.scenario().state(), ScenarioState::Aborted);
    assert!(!bench.device.crc_engine().corruption_pending());
    assert!(!bench.device.model().registers().is_forced(addr::CRC_ERROR_COUNT));
    assert!(bench.device.model().command().clamp.is_none());

    let frames = ping_tick(&mut bench, b"2");
    assert_eq!(frames.len(), 2);
    assert!(Packet::parse(&frames[0]).is_err());
    assert_eq!(Packet::parse(&frames[1]).unwrap().payload.as_slice(), b"\x002");
    assert_eq!(bench.peek_u32(addr::CRC_ERROR_COUNT), 0);
    assert_eq!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::SCENARIO_ACTIVE, 0);
}

#[test]
fn test_deactivate_releases_clamp_before_next_step() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "held-overspeed", "events": [
            {"offset_ms": 0, "target": "physics", "action": "clamp",
             "params": {"quantity": "speed_rpm", "value": 7000.0, "duration_ms": 10000}}
        ]}"#,
    );
    bench.run(3);
    assert!((bench.wheel.state().speed_rpm() - 7000.0).abs() < 1e-6);

    bench.device.deactivate_scenario();
    // No comms poll in between: the release must already be in the mailbox.
    let snap = bench.wheel.step();
    assert!(snap.state.speed_rpm() < 7000.0, "clamp still applied");
}

#[test]
fn test_completion_waits_for_counted_hooks() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "late-corrupt", "events": [
            {"offset_ms": 30, "target": "crc", "action": "corrupt", "params": {"count": 3}}
        ]}"#,
    );

    bench.run(5);
    assert_eq!(bench.device.crc_engine().pending_corruptions(), 3);
    assert_eq!(bench.device.scenario().state(), ScenarioState::Running);

    for tag in [b"a", b"b", b"c"] {
        let frames = ping_tick(&mut bench, tag);
        assert!(Packet::parse(&frames[0]).is_err());
        assert_eq!(bench.device.scenario().state(), ScenarioState::Running);
    }
    assert!(!bench.device.crc_engine().corruption_pending());

    bench.tick();
    assert_eq!(bench.device.scenario().state(), ScenarioState::Completed);
    bench.tick();
    assert_eq!(bench.peek_u32(addr::STATUS_FLAGS) & status_flags::SCENARIO_ACTIVE, 0);
}

#[test]
fn test_scenario_can_be_rerun_after_completion() {
    let mut bench = Bench::new();
    start(
        &mut bench,
        r#"{"name": "one-shot", "events": [
            {"offset_ms": 0, "target": "crc", "action": "corrupt", "params": {"count": 1}}
        ]}"#,
    );
    let frames = ping_tick(&mut bench, b"x");
    assert!(Packet::parse(&frames[0]).is_err());
    bench.tick();
    assert_eq!(bench.device.scenario().state(), ScenarioState::Completed);

    bench.device.start_scenario(bench.now_ms).unwrap();
    bench.tick();
    assert_eq!(bench.device.scenario().stats().runs, 2);
    assert_eq!(bench.device.crc_engine().pending_corruptions(), 1);
    assert_eq!(bench.device.crc_engine().corrupted_total(), 1);
}

#[test]
fn test_demo_scenarios_parse() {
    let demos = [
        include_str!("../demos/crc_then_drop.json"),
        include_str!("../demos/sensor_faults.json"),
    ];
    for text in demos {
        let scenario = Scenario::from_json(text).unwrap();
        assert!(!scenario.events.is_empty());
        assert!(scenario.span_ms() > 0);
    }
}

#[test]
fn test_bad_scenarios_are_rejected() {
    let mut bench = Bench::new();
    assert!(matches!(
        bench.device.start_scenario(0),
        Err(ScenarioError::InvalidTransition { .. })
    ));

    let err = bench
        .device
        .load_scenario(r#"{"name": "x", "events": [{"offset_ms": 0, "target": "adc"}]}"#)
        .unwrap_err();
    assert!(matches!(err, ScenarioError::UnknownTarget { .. }));
    assert!(bench.device.load_scenario("{\"name\": ").is_err());
    assert_eq!(bench.device.scenario().state(), ScenarioState::Unloaded);
}

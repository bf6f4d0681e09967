mod common;

use common::*;
use nspwheel::fixed::{FixedPoint, Q16_16, Q24_8};
use nspwheel::protocol::ReplyStatus;
use nspwheel::registers::{addr, Access, REGISTERS};
use nspwheel::slip::SLIP_END;

fn wire_bytes(raw: u32, width: usize) -> Vec<u8> {
    raw.to_le_bytes()[..width].to_vec()
}

#[test]
fn test_poke_then_peek_returns_exact_bytes() {
    let mut bench = Bench::new();

    for def in REGISTERS.iter().filter(|def| def.access == Access::ReadWrite) {
        let value = def.min + (def.max - def.min) / 2.0;
        let bytes = wire_bytes(def.kind.encode(value), def.kind.width());

        assert_eq!(bench.poke(def.address, &bytes), ReplyStatus::Ok, "poke {}", def.name);
        assert_eq!(bench.peek(def.address), bytes, "peek {}", def.name);
    }
}

#[test]
fn test_identity_registers() {
    let mut bench = Bench::new();
    assert_eq!(bench.peek_u32(addr::DEVICE_ID), 0x4E53_5057);
    assert_eq!(bench.peek(addr::HARDWARE_REVISION).len(), 2);
    assert_eq!(bench.peek(addr::MOTOR_TEMP_C), vec![0x00, 20]);
}

#[test]
fn test_read_only_registers_refuse_writes() {
    let mut bench = Bench::new();

    for def in REGISTERS.iter().filter(|def| def.access == Access::ReadOnly) {
        let before = bench.peek(def.address);
        let bytes = vec![0x5A; def.kind.width()];
        assert_eq!(bench.poke(def.address, &bytes), ReplyStatus::ReadOnly, "{}", def.name);
        assert_eq!(bench.peek(def.address), before);
    }
}

#[test]
fn test_write_errors() {
    let mut bench = Bench::new();

    assert_eq!(bench.poke(0x0002, &[0, 0, 0, 0]), ReplyStatus::UnknownRegister);
    assert_eq!(bench.poke(0xFFFF, &[0]), ReplyStatus::UnknownRegister);
    assert_eq!(bench.poke(addr::CURRENT_LIMIT_A, &[0, 0, 5]), ReplyStatus::InvalidLength);
    assert_eq!(
        bench.poke(addr::CURRENT_LIMIT_A, &Q16_16::from_f64(10.5).to_le_bytes()),
        ReplyStatus::OutOfRange
    );
    assert_eq!(bench.poke(addr::CONTROL_MODE, &[5]), ReplyStatus::OutOfRange);

    // Rejected writes leave the register alone.
    assert_eq!(bench.peek(addr::CURRENT_LIMIT_A), Q16_16::from_f64(5.0).to_le_bytes().to_vec());

    let reply = bench.request(0x02, &[0x00]);
    assert_eq!(status(&reply), ReplyStatus::InvalidLength);
    let reply = bench.request(0x02, &0x0003u16.to_le_bytes());
    assert_eq!(status(&reply), ReplyStatus::UnknownRegister);
    assert_eq!(reply.payload.len(), 1);
}

#[test]
fn test_unsupported_command_code() {
    let mut bench = Bench::new();
    let reply = bench.request(0x1C, &[]);
    assert_eq!(status(&reply), ReplyStatus::UnsupportedCommand);
    assert_eq!(reply.ctrl.command(), 0x1C);
}

#[test]
fn test_ping_echo_over_the_line() {
    let mut bench = Bench::new();
    let reply = bench.request(0x00, b"ping");
    assert_eq!(reply.dest, HOST);
    assert_eq!(reply.src, DEVICE);
    assert!(!reply.ctrl.poll());
    assert_eq!(reply.payload.as_slice(), b"\x00ping");
}

#[test]
fn test_broadcast_executes_without_reply() {
    let mut bench = Bench::new();
    let value = Q16_16::from_f64(2.5).to_le_bytes();
    let mut payload = addr::CURRENT_LIMIT_A.to_le_bytes().to_vec();
    payload.extend_from_slice(&value);

    bench.send_to(0xFF, true, 0x03, &payload);
    bench.poll();
    assert!(bench.frames().is_empty());
    assert_eq!(bench.peek(addr::CURRENT_LIMIT_A), value.to_vec());
}

#[test]
fn test_request_without_poll_gets_no_reply() {
    let mut bench = Bench::new();
    let mut payload = addr::DIRECTION.to_le_bytes().to_vec();
    payload.push(1);

    bench.send_to(DEVICE, false, 0x03, &payload);
    bench.poll();
    assert!(bench.frames().is_empty());
    assert_eq!(bench.peek(addr::DIRECTION), vec![1]);
}

#[test]
fn test_other_address_is_ignored() {
    let mut bench = Bench::new();
    let mut payload = addr::DIRECTION.to_le_bytes().to_vec();
    payload.push(1);

    bench.send_to(0x21, true, 0x03, &payload);
    bench.poll();
    assert!(bench.frames().is_empty());
    assert_eq!(bench.peek(addr::DIRECTION), vec![0]);
    assert_eq!(bench.device.stats().frames_ignored, 1);
}

#[test]
fn test_line_errors_are_counted() {
    let mut bench = Bench::new();

    // Bad CRC
    bench.send_raw(&[SLIP_END, 0x20, 0x11, 0x80, 0x12, 0x34, SLIP_END]);
    // Bad escape, then a runt frame
    bench.send_raw(&[SLIP_END, 0x20, 0xDB, 0x01, SLIP_END]);
    bench.send_raw(&[SLIP_END, 0x20, 0x11, SLIP_END]);
    bench.poll();
    assert!(bench.frames().is_empty());

    assert_eq!(bench.peek_u32(addr::CRC_ERROR_COUNT), 1);
    assert_eq!(bench.peek_u32(addr::FRAMING_ERROR_COUNT), 2);

    // Counters are writable.
    assert_eq!(bench.poke(addr::CRC_ERROR_COUNT, &[0, 0, 0, 0]), ReplyStatus::Ok);
    assert_eq!(bench.peek_u32(addr::CRC_ERROR_COUNT), 0);
}

#[test]
fn test_app_command_sets_mode_and_setpoint() {
    let mut bench = Bench::new();
    let rpm = Q24_8::from_f64(1500.0);

    assert_eq!(bench.app_command(2, 1, rpm), ReplyStatus::Ok);
    assert_eq!(bench.peek(addr::CONTROL_MODE), vec![2]);
    assert_eq!(bench.peek(addr::DIRECTION), vec![1]);
    assert_eq!(bench.peek(addr::SPEED_SETPOINT_RPM), rpm.to_le_bytes().to_vec());

    // Out-of-range setpoint rejects the whole command.
    assert_eq!(bench.app_command(1, 0, Q16_16::from_f64(12.0)), ReplyStatus::OutOfRange);
    assert_eq!(bench.peek(addr::CONTROL_MODE), vec![2]);
    assert_eq!(bench.app_command(7, 0, Q16_16::from_f64(1.0)), ReplyStatus::InvalidMode);
}

#[test]
fn test_speed_mode_spins_the_wheel_up() {
    let mut bench = Bench::new();
    assert_eq!(bench.app_command(2, 0, Q24_8::from_f64(1000.0)), ReplyStatus::Ok);
    bench.run(300);

    let speed = Q24_8::from_raw(bench.peek_u32(addr::SPEED_RPM)).to_f64();
    assert!(speed > 100.0, "speed {speed}");
    assert!(bench.peek_u32(addr::UPTIME_S) >= 2);
}

#[test]
fn test_telemetry_blocks_over_the_line() {
    let mut bench = Bench::new();
    bench.run(5);

    let reply = bench.request(0x07, &[0]);
    assert_eq!(status(&reply), ReplyStatus::Ok);
    assert!(reply.payload.len() > 1);

    let reply = bench.request(0x07, &[0xEE]);
    assert_eq!(status(&reply), ReplyStatus::UnknownBlock);
    let reply = bench.request(0x07, &[]);
    assert_eq!(status(&reply), ReplyStatus::InvalidLength);
}

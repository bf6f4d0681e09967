#![allow(dead_code)]

use nspwheel::channel::channel;
use nspwheel::fixed::FixedPoint;
use nspwheel::io::MemoryStream;
use nspwheel::protocol::{Control, Packet, ReplyStatus};
use nspwheel::slip::{self, SlipDecoder, MAX_FRAME_LEN};
use nspwheel::{ControlCommand, DeviceConfig, PhysicsContext, WheelDevice, WheelSnapshot};

pub const HOST: u8 = 0x11;
pub const DEVICE: u8 = 0x20;
pub const TICK_MS: u64 = 10;

/// A device and its physics context wired through an in-memory line.
pub struct Bench {
    pub device: WheelDevice<16>,
    pub wheel: PhysicsContext<16>,
    pub line: MemoryStream,
    pub now_ms: u64,
    decoder: SlipDecoder<MAX_FRAME_LEN>,
}

impl Bench {
    pub fn new() -> Self {
        let config = DeviceConfig::default();
        let (comms, physics) =
            channel::<ControlCommand, WheelSnapshot, 16>(ControlCommand::default());
        Self {
            device: WheelDevice::new(config.clone(), comms),
            wheel: PhysicsContext::new(config.params, physics),
            line: MemoryStream::new(),
            now_ms: 0,
            decoder: SlipDecoder::new(),
        }
    }

    pub fn poll(&mut self) {
        self.device.poll(&mut self.line, self.now_ms).unwrap();
    }

    /// One physics step, then one comms poll a tick later.
    pub fn tick(&mut self) {
        self.wheel.step();
        self.now_ms += TICK_MS;
        self.poll();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.line.feed(bytes);
    }

    pub fn send_to(&mut self, dest: u8, poll: bool, command: u8, payload: &[u8]) {
        let packet = Packet::new(dest, HOST, Control::new(poll, false, false, command), payload)
            .unwrap();
        let bytes = packet.to_bytes().unwrap();
        let frame = slip::encode(&bytes).unwrap();
        self.line.feed(&frame);
    }

    pub fn send(&mut self, command: u8, payload: &[u8]) {
        self.send_to(DEVICE, true, command, payload);
    }

    /// Every de-SLIPed frame written since the last call.
    pub fn frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for byte in self.line.take_output() {
            if let Some(frame) = self.decoder.push(byte).unwrap() {
                frames.push(frame.to_vec());
            }
        }
        frames
    }

    /// Send one request, poll once and parse the single reply.
    pub fn request(&mut self, command: u8, payload: &[u8]) -> Packet {
        self.send(command, payload);
        self.poll();
        let frames = self.frames();
        assert_eq!(frames.len(), 1, "expected exactly one reply");
        Packet::parse(&frames[0]).unwrap()
    }

    pub fn peek(&mut self, address: u16) -> Vec<u8> {
        let reply = self.request(0x02, &address.to_le_bytes());
        assert_eq!(status(&reply), ReplyStatus::Ok);
        reply.payload[1..].to_vec()
    }

    pub fn peek_u32(&mut self, address: u16) -> u32 {
        let bytes = self.peek(address);
        let mut raw = [0u8; 4];
        raw[..bytes.len()].copy_from_slice(&bytes);
        u32::from_le_bytes(raw)
    }

    pub fn poke(&mut self, address: u16, value: &[u8]) -> ReplyStatus {
        let mut payload = address.to_le_bytes().to_vec();
        payload.extend_from_slice(value);
        status(&self.request(0x03, &payload))
    }

    pub fn app_command(&mut self, mode: u8, direction: u8, setpoint: impl FixedPoint) -> ReplyStatus {
        let mut payload = vec![mode, direction];
        payload.extend_from_slice(&setpoint.to_le_bytes());
        status(&self.request(0x08, &payload))
    }

    pub fn clear_fault(&mut self, mask: u32) -> Packet {
        self.request(0x09, &mask.to_le_bytes())
    }
}

pub fn status(reply: &Packet) -> ReplyStatus {
    ReplyStatus::from_code(reply.payload[0]).unwrap()
}

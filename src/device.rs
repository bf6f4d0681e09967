//! The communications context.
//!
//! `WheelDevice` owns the receive decoder, the transmit path with its
//! injection hooks, the scenario engine and the comms end of the channel.
//! One call to [`WheelDevice::poll`] is one loop iteration: fold in the latest
//! snapshot, advance the scenario, serve every complete request, release
//! delayed frames, hand the control record to physics and flush output.

use crate::channel::{CommsEndpoint, RING_CAPACITY};
use crate::crc::CrcEngine;
use crate::dispatcher::{dispatch, Response};
use crate::fault::FaultLog;
use crate::io::ByteStream;
use crate::model::DeviceModel;
use crate::protocol::{match_address, AddressMatch, Packet, ProtocolError};
use crate::scenario::{HookCommand, ScenarioEngine, ScenarioError, ScenarioState};
use crate::scheduler::DelayLine;
use crate::slip::{self, EncodedFrame, FrameAction, FrameHook, SlipDecoder, MAX_FRAME_LEN};
use crate::subsystems::{ControlMode, WheelParams};
use crate::tick::{ControlCommand, WheelSnapshot};
use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_DEVICE_ADDRESS: u8 = 0x20;
/// Bytes read from the line per poll at most.
const RX_BUDGET: usize = 1024;
const TX_QUEUE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub address: u8,
    pub params: WheelParams,
    pub tick_period_ms: u64,
    pub comms_poll_us: u64,
    pub status_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_DEVICE_ADDRESS,
            params: WheelParams::default(),
            tick_period_ms: crate::subsystems::TICK_PERIOD_MS,
            comms_poll_us: 1000,
            status_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub frames_received: u32,
    pub frames_ignored: u32,
    pub requests_served: u32,
    pub replies_sent: u32,
    pub replies_dropped: u32,
    pub replies_duplicated: u32,
    pub replies_delayed: u32,
    pub tx_overflows: u32,
}

/// Summary line for periodic status output.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub address: u8,
    pub uptime_ms: u64,
    pub mode: ControlMode,
    pub speed_rpm: f64,
    pub current_a: f64,
    pub bus_voltage_v: f64,
    pub motor_temp_c: f64,
    pub fault_latch: u32,
    pub warnings: u32,
    pub trip_count: u32,
    pub crc_errors: u32,
    pub framing_errors: u32,
    pub ring_overflows: u32,
    pub tick_overruns: u32,
    pub max_jitter_us: u32,
    pub scenario: ScenarioState,
    pub stats: DeviceStats,
}

pub struct WheelDevice<const N: usize = RING_CAPACITY> {
    config: DeviceConfig,
    model: DeviceModel,
    endpoint: CommsEndpoint<ControlCommand, WheelSnapshot, N>,
    decoder: SlipDecoder<MAX_FRAME_LEN>,
    crc: CrcEngine,
    frame_hook: FrameHook,
    delay_line: DelayLine,
    tx: Deque<u8, TX_QUEUE_LEN>,
    scenario: ScenarioEngine,
    fault_log: FaultLog,
    stats: DeviceStats,
}

impl<const N: usize> WheelDevice<N> {
    pub fn new(
        config: DeviceConfig,
        mut endpoint: CommsEndpoint<ControlCommand, WheelSnapshot, N>,
    ) -> Self {
        let model = DeviceModel::new();
        endpoint.send(*model.command());
        info!(address = config.address, "reaction wheel device ready");
        Self {
            config,
            model,
            endpoint,
            decoder: SlipDecoder::new(),
            crc: CrcEngine::new(),
            frame_hook: FrameHook::new(),
            delay_line: DelayLine::new(),
            tx: Deque::new(),
            scenario: ScenarioEngine::new(),
            fault_log: FaultLog::new(),
            stats: DeviceStats::default(),
        }
    }

    /// One communications-loop iteration.
    pub fn poll<S: ByteStream>(&mut self, stream: &mut S, now_ms: u64) -> Result<(), S::Error> {
        self.ingest_snapshots();
        self.run_scenario(now_ms);

        for _ in 0..RX_BUDGET {
            let byte = match stream.read() {
                Ok(byte) => byte,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(err)) => return Err(err),
            };
            match self.decoder.push(byte) {
                Ok(Some(frame)) => self.handle_frame(&frame, now_ms),
                Ok(None) => {}
                Err(err) => {
                    self.model.count_framing_error();
                    warn!(%err, "SLIP framing error");
                }
            }
        }

        for frame in self.delay_line.take_due(now_ms) {
            self.enqueue(&frame);
        }

        if let Some(command) = self.model.take_command() {
            self.endpoint.send(command);
        }

        self.flush(stream)
    }

    fn ingest_snapshots(&mut self) {
        if let Some(snap) = self.endpoint.latest() {
            self.model.set_ring_overflows(self.endpoint.overflow_count());
            self.model.apply_snapshot(snap);
            let protection = &snap.protection;
            if let Some(fault) = self.fault_log.observe(
                protection.latched,
                protection.trip_count,
                protection.last_trip,
                snap.uptime_ms,
            ) {
                info!(fault = fault.name(), uptime_ms = snap.uptime_ms, "trip recorded");
            }
        }
    }

    fn run_scenario(&mut self, now_ms: u64) {
        let hooks_pending = self.crc.corruption_pending()
            || self.frame_hook.is_active()
            || !self.delay_line.is_empty();
        for command in self.scenario.update(now_ms, hooks_pending) {
            self.apply_hook(command);
        }
        self.model.set_scenario_active(self.scenario.is_active());
    }

    fn apply_hook(&mut self, command: HookCommand) {
        debug!(?command, "applying scenario hook");
        match command {
            HookCommand::CorruptCrc { count } => self.crc.corrupt_next(count),
            HookCommand::DropFrames { count } => self.frame_hook.drop_next(count),
            HookCommand::DuplicateFrames { count } => self.frame_hook.duplicate_next(count),
            HookCommand::DelayFrames { count, delay_ms } => {
                self.frame_hook.delay_next(count, delay_ms)
            }
            HookCommand::ForceRegister { address, value } => {
                if let Err(err) = self.model.force_register(address, value) {
                    warn!(%err, "scenario register force rejected");
                }
            }
            HookCommand::ReleaseRegister { address } => self.model.release_register(address),
            HookCommand::ForceTrip { fault } => self.model.trip(fault),
            HookCommand::Clamp(clamp) => self.model.set_clamp(Some(clamp)),
            HookCommand::ReleaseClamp { quantity } => self.model.release_clamp(quantity),
        }
    }

    fn handle_frame(&mut self, frame: &[u8], now_ms: u64) {
        self.stats.frames_received = self.stats.frames_received.wrapping_add(1);

        let request = match Packet::parse(frame) {
            Ok(packet) => packet,
            Err(ProtocolError::CrcMismatch { computed, received }) => {
                self.model.count_crc_error();
                warn!(
                    computed = format_args!("0x{computed:04X}"),
                    received = format_args!("0x{received:04X}"),
                    "CRC mismatch, frame dropped"
                );
                return;
            }
            Err(err) => {
                self.model.count_framing_error();
                warn!(%err, "malformed packet dropped");
                return;
            }
        };

        let target = match_address(request.dest, self.config.address);
        if target == AddressMatch::Other {
            self.stats.frames_ignored = self.stats.frames_ignored.wrapping_add(1);
            debug!(dest = request.dest, "frame for another address");
            return;
        }

        let response = dispatch(&mut self.model, request.ctrl.command(), &request.payload);
        self.stats.requests_served = self.stats.requests_served.wrapping_add(1);
        debug!(
            command = request.ctrl.command(),
            status = ?response.status,
            broadcast = target == AddressMatch::Broadcast,
            poll = request.ctrl.poll(),
            "request served"
        );

        if target == AddressMatch::Broadcast || !request.ctrl.poll() {
            return;
        }
        if let Err(err) = self.send_reply(&request, &response, now_ms) {
            warn!(%err, "failed to build reply");
        }
    }

    fn send_reply(
        &mut self,
        request: &Packet,
        response: &Response,
        now_ms: u64,
    ) -> Result<(), ProtocolError> {
        let reply = request.reply(&response.to_payload())?;
        let mut raw = [0u8; MAX_FRAME_LEN];
        let len = reply.encode_with(&mut self.crc, &mut raw)?;
        let frame = slip::encode(&raw[..len]).map_err(|_| ProtocolError::BufferTooSmall)?;

        match self.frame_hook.next_action() {
            FrameAction::Send => self.enqueue(&frame),
            FrameAction::Drop => {
                self.stats.replies_dropped += 1;
                debug!("reply dropped by injection");
            }
            FrameAction::Duplicate => {
                self.stats.replies_duplicated += 1;
                self.enqueue(&frame);
                self.enqueue(&frame);
            }
            FrameAction::Delay { delay_ms } => {
                self.stats.replies_delayed += 1;
                self.delay_line.schedule(frame, now_ms, delay_ms);
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, frame: &EncodedFrame) {
        if TX_QUEUE_LEN - self.tx.len() < frame.len() {
            self.stats.tx_overflows += 1;
            warn!(len = frame.len(), "transmit queue full, reply discarded");
            return;
        }
        for &byte in frame.iter() {
            let _ = self.tx.push_back(byte);
        }
        self.stats.replies_sent = self.stats.replies_sent.wrapping_add(1);
    }

    fn flush<S: ByteStream>(&mut self, stream: &mut S) -> Result<(), S::Error> {
        while let Some(&byte) = self.tx.front() {
            match stream.write(byte) {
                Ok(()) => {
                    self.tx.pop_front();
                }
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(err)) => return Err(err),
            }
        }
        match stream.flush() {
            Ok(()) | Err(nb::Error::WouldBlock) => Ok(()),
            Err(nb::Error::Other(err)) => Err(err),
        }
    }

    pub fn load_scenario(&mut self, json: &str) -> Result<(), ScenarioError> {
        self.scenario.load_json(json)
    }

    /// Arm and start the loaded scenario at `now_ms`.
    pub fn start_scenario(&mut self, now_ms: u64) -> Result<(), ScenarioError> {
        self.scenario.arm()?;
        self.scenario.start(now_ms)?;
        self.model.set_scenario_active(true);
        Ok(())
    }

    /// Abort the scenario and undo every injection hook now. Delayed frames
    /// are released immediately.
    pub fn deactivate_scenario(&mut self) {
        self.scenario.deactivate();
        self.crc.restore();
        self.frame_hook.restore();
        for frame in self.delay_line.drain() {
            self.enqueue(&frame);
        }
        self.model.release_all_registers();
        self.model.set_clamp(None);
        self.model.set_scenario_active(false);
        // Physics must not step again under the released clamp.
        if let Some(command) = self.model.take_command() {
            self.endpoint.send(command);
        }
        info!("scenario hooks cleared");
    }

    pub fn scenario(&self) -> &ScenarioEngine {
        &self.scenario
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn fault_log(&self) -> &FaultLog {
        &self.fault_log
    }

    pub fn crc_engine(&self) -> &CrcEngine {
        &self.crc
    }

    pub fn pending_tx(&self) -> usize {
        self.tx.len()
    }

    pub fn status(&self) -> DeviceStatus {
        let snap = self.model.snapshot();
        let diagnostics = self.model.diagnostics();
        DeviceStatus {
            address: self.config.address,
            uptime_ms: snap.uptime_ms,
            mode: snap.mode,
            speed_rpm: snap.state.speed_rpm(),
            current_a: snap.state.current_a,
            bus_voltage_v: snap.state.bus_voltage_v,
            motor_temp_c: snap.state.motor_temp_c,
            fault_latch: snap.protection.latched,
            warnings: snap.protection.warnings,
            trip_count: diagnostics.trip_count,
            crc_errors: diagnostics.crc_errors,
            framing_errors: diagnostics.framing_errors,
            ring_overflows: diagnostics.ring_overflows,
            tick_overruns: snap.overruns,
            max_jitter_us: snap.max_jitter_us,
            scenario: self.scenario.state(),
            stats: self.stats,
        }
    }
}

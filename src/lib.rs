//! # NSP Reaction Wheel Emulator
//!
//! A firmware-style emulator of a spacecraft reaction wheel that speaks the
//! NSP protocol over a SLIP-framed serial line, for hardware-in-the-loop
//! testing of attitude-control software.
//!
//! ## Features
//!
//! - **Transport**: CRC-16/MCRF4XX, SLIP framing and NSP packets
//! - **Device model**: register map with PEEK/POKE, application commands and
//!   telemetry blocks
//! - **Physics**: deterministic 100 Hz wheel, drive, power and thermal model
//! - **Protection**: latched hard trips, soft warnings, fault clearing
//! - **Fault injection**: JSON scenarios driving CRC, framing, register,
//!   protection and physics hooks on a timeline
//! - **Bounded memory**: fixed-capacity buffers, lock-free channel between the
//!   communications and physics contexts
//!
//! ## Quick Start
//!
//! ```rust
//! use nspwheel::channel::channel;
//! use nspwheel::io::MemoryStream;
//! use nspwheel::{ControlCommand, DeviceConfig, PhysicsContext, WheelDevice, WheelSnapshot};
//!
//! let config = DeviceConfig::default();
//! let (comms, physics) = channel::<ControlCommand, WheelSnapshot, 16>(ControlCommand::default());
//! let mut device = WheelDevice::new(config.clone(), comms);
//! let mut wheel = PhysicsContext::new(config.params, physics);
//!
//! let mut line = MemoryStream::new();
//! for ms in (0..100).step_by(10) {
//!     wheel.step();
//!     device.poll(&mut line, ms).unwrap();
//! }
//! assert_eq!(device.model().snapshot().state.ticks, 10);
//! ```
//!
//! ## Architecture
//!
//! - [`crc`], [`slip`], [`protocol`] - wire format
//! - [`registers`], [`model`], [`dispatcher`], [`telemetry`] - device model
//! - [`subsystems`], [`protection`], [`tick`] - physics context
//! - [`scenario`] - fault-injection timeline
//! - [`channel`] - snapshot ring and command mailbox
//! - [`device`] - communications context tying the above together

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod crc;
pub mod device;
pub mod dispatcher;
pub mod fault;
pub mod fixed;
pub mod io;
pub mod model;
pub mod protection;
pub mod protocol;
pub mod registers;
pub mod scenario;
pub mod scheduler;
pub mod slip;
pub mod subsystems;
pub mod telemetry;
pub mod tick;

// Re-export main public types for convenience
pub use device::{DeviceConfig, WheelDevice};
pub use model::DeviceModel;
pub use protocol::Packet;
pub use scenario::{Scenario, ScenarioEngine};
pub use subsystems::{WheelParams, WheelState};
pub use tick::{ControlCommand, PhysicsContext, WheelSnapshot};

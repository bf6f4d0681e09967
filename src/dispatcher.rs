//! NSP command dispatch.
//!
//! Maps a request's command code and payload onto the device model and
//! produces the reply status plus data. Framing and addressing are handled
//! by the caller.

use crate::model::DeviceModel;
use crate::protection::{fault_bits, FaultKind};
use crate::protocol::{CommandCode, ReplyStatus, MAX_PAYLOAD_LEN};
use crate::registers::RegisterError;
use crate::subsystems::ControlMode;
use crate::telemetry::TelemetryError;
use heapless::Vec;
use tracing::debug;

/// Reply data excludes the leading status byte.
pub const MAX_RESPONSE_DATA: usize = MAX_PAYLOAD_LEN - 1;

const APP_COMMAND_LEN: usize = 6;

pub type ResponseData = Vec<u8, MAX_RESPONSE_DATA>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ReplyStatus,
    pub data: ResponseData,
}

impl Response {
    pub fn ok() -> Self {
        Self::status(ReplyStatus::Ok)
    }

    pub fn status(status: ReplyStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }

    fn with_data(status: ReplyStatus, data: &[u8]) -> Self {
        match Vec::from_slice(data) {
            Ok(data) => Self { status, data },
            Err(()) => Self::status(ReplyStatus::InvalidLength),
        }
    }

    /// Status byte followed by the data, as carried in the reply packet.
    pub fn to_payload(&self) -> Vec<u8, MAX_PAYLOAD_LEN> {
        let mut payload = Vec::new();
        let _ = payload.push(self.status as u8);
        let _ = payload.extend_from_slice(&self.data);
        payload
    }
}

impl From<RegisterError> for ReplyStatus {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::UnknownRegister(_) => ReplyStatus::UnknownRegister,
            RegisterError::ReadOnly(_) => ReplyStatus::ReadOnly,
            RegisterError::InvalidLength { .. } => ReplyStatus::InvalidLength,
            RegisterError::OutOfRange { .. } => ReplyStatus::OutOfRange,
        }
    }
}

impl From<TelemetryError> for ReplyStatus {
    fn from(err: TelemetryError) -> Self {
        match err {
            TelemetryError::UnknownBlock(_) => ReplyStatus::UnknownBlock,
        }
    }
}

fn address(payload: &[u8]) -> Option<u16> {
    match payload {
        [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
        _ => None,
    }
}

/// Execute one request against `model`.
pub fn dispatch(model: &mut DeviceModel, code: u8, payload: &[u8]) -> Response {
    let Some(command) = CommandCode::from_code(code) else {
        debug!(code, "unsupported command");
        return Response::status(ReplyStatus::UnsupportedCommand);
    };

    match command {
        CommandCode::Ping => Response::with_data(ReplyStatus::Ok, payload),

        CommandCode::Peek => {
            let [lo, hi] = payload else {
                return Response::status(ReplyStatus::InvalidLength);
            };
            match model.peek(u16::from_le_bytes([*lo, *hi])) {
                Ok(bytes) => Response::with_data(ReplyStatus::Ok, &bytes),
                Err(err) => Response::status(err.into()),
            }
        }

        CommandCode::Poke => {
            let Some(address) = address(payload) else {
                return Response::status(ReplyStatus::InvalidLength);
            };
            match model.poke(address, &payload[2..]) {
                Ok(()) => Response::ok(),
                Err(err) => Response::status(err.into()),
            }
        }

        CommandCode::ApplicationTelemetry => {
            let [block] = payload else {
                return Response::status(ReplyStatus::InvalidLength);
            };
            match model.telemetry(*block) {
                Ok(bytes) => Response::with_data(ReplyStatus::Ok, &bytes),
                Err(err) => Response::status(err.into()),
            }
        }

        CommandCode::ApplicationCommand => {
            if payload.len() != APP_COMMAND_LEN {
                return Response::status(ReplyStatus::InvalidLength);
            }
            let Some(mode) = ControlMode::from_code(payload[0]) else {
                return Response::status(ReplyStatus::InvalidMode);
            };
            match model.app_command(mode, payload[1], &payload[2..]) {
                Ok(()) => Response::ok(),
                Err(err) => Response::status(err.into()),
            }
        }

        CommandCode::ClearFault => {
            let mask = match payload {
                [] => fault_bits::ALL,
                [a, b, c, d] => u32::from_le_bytes([*a, *b, *c, *d]),
                _ => return Response::status(ReplyStatus::InvalidLength),
            };
            match model.clear_fault(mask) {
                Ok(()) => Response::ok(),
                Err(active) => Response::with_data(ReplyStatus::FaultActive, &active.to_le_bytes()),
            }
        }

        CommandCode::ConfigureProtection => match model.configure_protection(payload) {
            Ok(()) => Response::ok(),
            Err(err) => Response::status(err.into()),
        },

        CommandCode::TripLcl => {
            model.trip(FaultKind::LclTrip);
            Response::ok()
        }
    }
}

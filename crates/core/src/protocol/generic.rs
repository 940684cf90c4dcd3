//! Generic 64-byte vendor report framing, used by SteelSeries and unknown
//! vendors that follow the same layout.
//!
//! `[0]` opcode high (bit 7 set on error replies), `[1]` opcode low,
//! `[2]` payload length (<= 60), payload, `[63]` 8-bit sum of bytes 0..63.
//! Opcodes with a zero high byte are device notifications.

use super::{
    Capability, ChecksumKind, CommandResult, CommandStatus, Decoded, DeviceEvent, ProtocolCommand,
};
use crate::error::{Error, Result};
use crate::profile::{ButtonAction, PollingRate};

pub const REPORT_LEN: usize = 64;
pub const MAX_PAYLOAD: usize = 60;
pub const CHECKSUM: ChecksumKind = ChecksumKind::Sum8;

const ERROR_FLAG: u8 = 0x80;
const SUM_OFFSET: usize = REPORT_LEN - 1;

pub mod opcodes {
    pub const IDENTIFY: u16 = 0x0100;
    pub const SET_POLLING_RATE: u16 = 0x0201;
    pub const SET_DPI: u16 = 0x030A;
    pub const SET_BUTTON: u16 = 0x0601;
    pub const SELECT_PROFILE: u16 = 0x0701;
}

fn capability_of(opcode: u16) -> Option<Capability> {
    match opcode {
        opcodes::IDENTIFY => Some(Capability::Identify),
        opcodes::SET_POLLING_RATE => Some(Capability::PollingRate),
        opcodes::SET_DPI => Some(Capability::Dpi),
        opcodes::SET_BUTTON => Some(Capability::ButtonMapping),
        opcodes::SELECT_PROFILE => Some(Capability::OnboardProfiles),
        _ => None,
    }
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Rate index: 0 = 1000 Hz, 1 = 500 Hz, 2 = 250 Hz, 3 = 125 Hz.
fn rate_code(rate: PollingRate) -> u8 {
    match rate {
        PollingRate::Hz1000 => 0,
        PollingRate::Hz500 => 1,
        PollingRate::Hz250 => 2,
        PollingRate::Hz125 => 3,
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenericCodec;

impl GenericCodec {
    pub fn new() -> Self {
        Self
    }

    fn command(&self, capability: Capability, opcode: u16, payload: Vec<u8>) -> ProtocolCommand {
        ProtocolCommand::new(capability, opcode, payload, REPORT_LEN, CHECKSUM)
    }

    pub fn encode(&self, command: &ProtocolCommand) -> Result<Vec<u8>> {
        let payload = command.payload();
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            )));
        }
        let [hi, lo] = command.opcode().to_be_bytes();
        let mut buf = vec![0u8; REPORT_LEN];
        buf[0] = hi;
        buf[1] = lo;
        buf[2] = payload.len() as u8;
        buf[3..3 + payload.len()].copy_from_slice(payload);
        buf[SUM_OFFSET] = sum8(&buf[..SUM_OFFSET]);
        Ok(buf)
    }

    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<(u16, &'a [u8])> {
        if bytes.len() != REPORT_LEN {
            return Err(Error::protocol(format!(
                "frame length {} (expected {REPORT_LEN})",
                bytes.len()
            )));
        }
        let expected = sum8(&bytes[..SUM_OFFSET]);
        if bytes[SUM_OFFSET] != expected {
            return Err(Error::protocol(format!(
                "checksum mismatch: got 0x{:02X}, expected 0x{expected:02X}",
                bytes[SUM_OFFSET]
            )));
        }
        let len = bytes[2] as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::protocol(format!("payload length {len} exceeds {MAX_PAYLOAD}")));
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), &bytes[3..3 + len]))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        if bytes.len() < REPORT_LEN {
            return Ok(Decoded::Incomplete {
                needed: REPORT_LEN - bytes.len(),
            });
        }
        let (raw, payload) = self.parse(bytes)?;
        let [hi, lo] = raw.to_be_bytes();
        if hi & ERROR_FLAG != 0 {
            let code = payload.first().copied().unwrap_or(0);
            return Ok(Decoded::Response {
                opcode: u16::from_be_bytes([hi & !ERROR_FLAG, lo]),
                result: CommandResult::new(CommandStatus::Failed(code), None),
            });
        }
        if hi == 0 {
            return Ok(Decoded::Event(DeviceEvent {
                opcode: raw,
                payload: payload.to_vec(),
            }));
        }
        Ok(Decoded::Response {
            opcode: raw,
            result: CommandResult::ok(payload.to_vec()),
        })
    }

    pub fn decode_command(&self, frame: &[u8]) -> Result<ProtocolCommand> {
        let (opcode, payload) = self.parse(frame)?;
        let capability = capability_of(opcode)
            .ok_or_else(|| Error::protocol(format!("unknown opcode 0x{opcode:04X}")))?;
        Ok(self.command(capability, opcode, payload.to_vec()))
    }

    pub fn identify(&self) -> ProtocolCommand {
        self.command(Capability::Identify, opcodes::IDENTIFY, Vec::new())
    }

    /// DPI is little endian on this family.
    pub fn set_dpi(&self, dpi: u16) -> ProtocolCommand {
        self.command(Capability::Dpi, opcodes::SET_DPI, dpi.to_le_bytes().to_vec())
    }

    pub fn set_polling_rate(&self, rate: PollingRate) -> ProtocolCommand {
        self.command(
            Capability::PollingRate,
            opcodes::SET_POLLING_RATE,
            vec![rate_code(rate)],
        )
    }

    pub fn set_button(&self, button: u8, action: ButtonAction) -> ProtocolCommand {
        self.command(
            Capability::ButtonMapping,
            opcodes::SET_BUTTON,
            vec![button, action.wire_code()],
        )
    }

    pub fn select_profile(&self, profile: u8) -> ProtocolCommand {
        self.command(Capability::OnboardProfiles, opcodes::SELECT_PROFILE, vec![profile])
    }
}

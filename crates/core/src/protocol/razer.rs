//! Razer 90-byte feature report framing.
//!
//! Layout (offsets in bytes):
//!
//! ```text
//! 0      status (0x00 on requests)
//! 1      transaction id
//! 2..4   remaining packets (big endian, always 0 here)
//! 4      protocol type (0)
//! 5      data size (<= 80)
//! 6      command class
//! 7      command id
//! 8..88  arguments
//! 88     XOR of bytes 2..88
//! 89     reserved
//! ```
//!
//! Opcodes are `class << 8 | id`.

use super::{
    Capability, ChecksumKind, CommandResult, CommandStatus, Decoded, DeviceEvent, ProtocolCommand,
};
use crate::error::{Error, Result};
use crate::profile::{ButtonAction, PollingRate};

pub const REPORT_LEN: usize = 90;
pub const MAX_ARGS: usize = 80;
pub const CHECKSUM: ChecksumKind = ChecksumKind::Xor;

const CRC_OFFSET: usize = 88;
const ARGS_OFFSET: usize = 8;

/// Values of the status byte.
pub mod status {
    pub const NEW: u8 = 0x00;
    pub const BUSY: u8 = 0x01;
    pub const SUCCESS: u8 = 0x02;
    pub const FAILURE: u8 = 0x03;
    pub const TIMEOUT: u8 = 0x04;
    pub const NOT_SUPPORTED: u8 = 0x05;
}

pub mod opcodes {
    pub const SET_POLLING_RATE: u16 = 0x0005;
    pub const GET_FIRMWARE: u16 = 0x0081;
    pub const SET_BUTTON_ASSIGNMENT: u16 = 0x020C;
    pub const SET_DPI_XY: u16 = 0x0405;
    pub const SELECT_PROFILE: u16 = 0x0503;
}

/// Persist to the device's variable store rather than only the live value.
const VARSTORE: u8 = 0x01;

fn capability_of(opcode: u16) -> Option<Capability> {
    match opcode {
        opcodes::GET_FIRMWARE => Some(Capability::Identify),
        opcodes::SET_DPI_XY => Some(Capability::Dpi),
        opcodes::SET_POLLING_RATE => Some(Capability::PollingRate),
        opcodes::SET_BUTTON_ASSIGNMENT => Some(Capability::ButtonMapping),
        opcodes::SELECT_PROFILE => Some(Capability::OnboardProfiles),
        _ => None,
    }
}

fn crc(frame: &[u8]) -> u8 {
    frame[2..CRC_OFFSET].iter().fold(0u8, |acc, b| acc ^ b)
}

#[derive(Debug, Clone)]
pub struct RazerCodec {
    transaction_id: u8,
}

impl RazerCodec {
    pub fn new(transaction_id: u8) -> Self {
        Self { transaction_id }
    }

    pub fn transaction_id(&self) -> u8 {
        self.transaction_id
    }

    fn command(&self, capability: Capability, opcode: u16, payload: Vec<u8>) -> ProtocolCommand {
        ProtocolCommand::new(capability, opcode, payload, REPORT_LEN, CHECKSUM)
    }

    pub fn encode(&self, command: &ProtocolCommand) -> Result<Vec<u8>> {
        let args = command.payload();
        if args.len() > MAX_ARGS {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds {} argument bytes",
                args.len(),
                MAX_ARGS
            )));
        }
        let [class, id] = command.opcode().to_be_bytes();
        let mut buf = vec![0u8; REPORT_LEN];
        buf[0] = status::NEW;
        buf[1] = self.transaction_id;
        buf[5] = args.len() as u8;
        buf[6] = class;
        buf[7] = id;
        buf[ARGS_OFFSET..ARGS_OFFSET + args.len()].copy_from_slice(args);
        buf[CRC_OFFSET] = crc(&buf);
        Ok(buf)
    }

    /// Validate length, checksum and data size; returns (status, opcode, args).
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<(u8, u16, &'a [u8])> {
        if bytes.len() != REPORT_LEN {
            return Err(Error::protocol(format!(
                "frame length {} (expected {})",
                bytes.len(),
                REPORT_LEN
            )));
        }
        let expected = crc(bytes);
        if bytes[CRC_OFFSET] != expected {
            return Err(Error::protocol(format!(
                "checksum mismatch: got 0x{:02X}, expected 0x{:02X}",
                bytes[CRC_OFFSET], expected
            )));
        }
        let size = bytes[5] as usize;
        if size > MAX_ARGS {
            return Err(Error::protocol(format!("data size {size} exceeds {MAX_ARGS}")));
        }
        let opcode = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok((bytes[0], opcode, &bytes[ARGS_OFFSET..ARGS_OFFSET + size]))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        if bytes.len() < REPORT_LEN {
            return Ok(Decoded::Incomplete {
                needed: REPORT_LEN - bytes.len(),
            });
        }
        let (code, opcode, args) = self.parse(bytes)?;
        let status = match code {
            status::NEW => {
                return Ok(Decoded::Event(DeviceEvent {
                    opcode,
                    payload: args.to_vec(),
                }))
            }
            status::SUCCESS => CommandStatus::Ok,
            status::BUSY => CommandStatus::Busy,
            status::NOT_SUPPORTED => CommandStatus::NotSupported,
            other => CommandStatus::Failed(other),
        };
        Ok(Decoded::Response {
            opcode,
            result: CommandResult::new(status, Some(args.to_vec())),
        })
    }

    pub fn decode_command(&self, frame: &[u8]) -> Result<ProtocolCommand> {
        let (code, opcode, args) = self.parse(frame)?;
        if code != status::NEW {
            return Err(Error::protocol(format!(
                "status 0x{code:02X} is not a request"
            )));
        }
        let capability = capability_of(opcode)
            .ok_or_else(|| Error::protocol(format!("unknown opcode 0x{opcode:04X}")))?;
        Ok(self.command(capability, opcode, args.to_vec()))
    }

    pub fn identify(&self) -> ProtocolCommand {
        self.command(Capability::Identify, opcodes::GET_FIRMWARE, vec![0x00, 0x00])
    }

    pub fn set_dpi(&self, dpi: u16) -> ProtocolCommand {
        let [hi, lo] = dpi.to_be_bytes();
        self.command(
            Capability::Dpi,
            opcodes::SET_DPI_XY,
            vec![VARSTORE, hi, lo, hi, lo, 0x00, 0x00],
        )
    }

    pub fn set_polling_rate(&self, rate: PollingRate) -> ProtocolCommand {
        self.command(
            Capability::PollingRate,
            opcodes::SET_POLLING_RATE,
            vec![rate.interval_ms()],
        )
    }

    pub fn set_button(&self, button: u8, action: ButtonAction) -> ProtocolCommand {
        self.command(
            Capability::ButtonMapping,
            opcodes::SET_BUTTON_ASSIGNMENT,
            vec![VARSTORE, button + 1, action.wire_code()],
        )
    }

    pub fn select_profile(&self, profile: u8) -> ProtocolCommand {
        self.command(
            Capability::OnboardProfiles,
            opcodes::SELECT_PROFILE,
            vec![VARSTORE, profile],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond(request: &[u8], code: u8) -> Vec<u8> {
        let mut frame = request.to_vec();
        frame[0] = code;
        frame[CRC_OFFSET] = crc(&frame);
        frame
    }

    #[test]
    fn encode_places_header_and_crc() {
        let codec = RazerCodec::new(0x1F);
        let frame = codec.encode(&codec.set_dpi(1600)).unwrap();
        assert_eq!(frame.len(), REPORT_LEN);
        assert_eq!(frame[1], 0x1F);
        assert_eq!(frame[5], 7);
        assert_eq!(frame[6], 0x04);
        assert_eq!(frame[7], 0x05);
        assert_eq!(&frame[8..13], &[0x01, 0x06, 0x40, 0x06, 0x40]);
        let xor = frame[2..88].iter().fold(0u8, |a, b| a ^ b);
        assert_eq!(frame[88], xor);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let codec = RazerCodec::new(0xFF);
        let cmd = ProtocolCommand::new(Capability::Dpi, 0x0405, vec![0; 81], REPORT_LEN, CHECKSUM);
        assert!(matches!(codec.encode(&cmd), Err(Error::Protocol { .. })));
    }

    #[test]
    fn decode_success_response() {
        let codec = RazerCodec::new(0xFF);
        let req = codec.encode(&codec.identify()).unwrap();
        match codec.decode(&respond(&req, status::SUCCESS)).unwrap() {
            Decoded::Response { opcode, result } => {
                assert_eq!(opcode, opcodes::GET_FIRMWARE);
                assert!(result.is_ok());
                assert_eq!(result.payload().unwrap().len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_maps_status_codes() {
        let codec = RazerCodec::new(0xFF);
        let req = codec.encode(&codec.identify()).unwrap();
        let status_of = |code| match codec.decode(&respond(&req, code)).unwrap() {
            Decoded::Response { result, .. } => result.status(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(status_of(status::BUSY), CommandStatus::Busy);
        assert_eq!(status_of(status::NOT_SUPPORTED), CommandStatus::NotSupported);
        assert_eq!(status_of(status::FAILURE), CommandStatus::Failed(0x03));
        assert_eq!(status_of(status::TIMEOUT), CommandStatus::Failed(0x04));
    }

    #[test]
    fn decode_partial_frame_is_incomplete() {
        let codec = RazerCodec::new(0xFF);
        let frame = codec.encode(&codec.identify()).unwrap();
        assert_eq!(
            codec.decode(&frame[..30]).unwrap(),
            Decoded::Incomplete { needed: 60 }
        );
        assert_eq!(
            codec.decode(&[]).unwrap(),
            Decoded::Incomplete { needed: REPORT_LEN }
        );
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let codec = RazerCodec::new(0xFF);
        let mut frame = respond(&codec.encode(&codec.identify()).unwrap(), status::SUCCESS);
        frame[10] ^= 0x40;
        let err = codec.decode(&frame).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn decode_rejects_overlong_frame() {
        let codec = RazerCodec::new(0xFF);
        let mut frame = codec.encode(&codec.identify()).unwrap();
        frame.push(0);
        assert!(codec.decode(&frame).is_err());
    }

    #[test]
    fn unsolicited_frame_is_a_report() {
        let codec = RazerCodec::new(0xFF);
        let frame = codec.encode(&codec.select_profile(2)).unwrap();
        assert!(matches!(
            codec.decode(&frame).unwrap(),
            Decoded::Event(DeviceEvent { opcode: opcodes::SELECT_PROFILE, .. })
        ));
    }

    #[test]
    fn polling_rate_uses_interval_code() {
        let codec = RazerCodec::new(0xFF);
        assert_eq!(codec.set_polling_rate(PollingRate::Hz1000).payload(), &[1]);
        assert_eq!(codec.set_polling_rate(PollingRate::Hz125).payload(), &[8]);
    }
}

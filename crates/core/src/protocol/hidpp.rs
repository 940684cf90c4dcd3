//! HID++ 2.0 framing.
//!
//! HID++ uses two report formats:
//! - Short reports: 7 bytes (report ID 0x10), up to 3 parameter bytes
//! - Long reports: 20 bytes (report ID 0x11), up to 16 parameter bytes
//!
//! Opcodes are `feature_index << 8 | function`. Feature indices differ per
//! device firmware, so they are looked up through the ROOT feature right after
//! the identify round-trip and cached in a [`FeatureMap`].
//!
//! Protocol reference: libratbag (MIT) and Solaar (GPLv2, protocol knowledge only).

use super::{
    unsupported, Capability, ChecksumKind, CommandResult, CommandStatus, Decoded, DeviceEvent,
    ProtocolCommand,
};
use crate::error::{Error, Result};
use crate::profile::{ButtonAction, PollingRate};

pub const SHORT_REPORT_ID: u8 = 0x10;
pub const LONG_REPORT_ID: u8 = 0x11;
pub const SHORT_REPORT_LEN: usize = 7;
pub const LONG_REPORT_LEN: usize = 20;
pub const CHECKSUM: ChecksumKind = ChecksumKind::None;

/// Error reports carry this in the feature index slot.
pub const ERROR_FEATURE_INDEX: u8 = 0xFF;
/// Software ID placed in the low nibble of requests. Device-initiated
/// notifications carry 0 there.
const SW_ID: u8 = 0x01;
const PING_DATA: u8 = 0x5A;

/// HID++ 2.0 well-known feature IDs.
pub mod features {
    /// Root feature: ping and feature index lookup.
    pub const ROOT: u16 = 0x0000;
    pub const ADJUSTABLE_DPI: u16 = 0x2201;
    pub const REPORT_RATE: u16 = 0x8060;
    pub const REPROG_CONTROLS_V4: u16 = 0x1B04;
    pub const ONBOARD_PROFILES: u16 = 0x8100;
}

/// Well-known HID++ Control IDs (CIDs) for mouse buttons.
pub mod cids {
    pub const LEFT_CLICK: u16 = 0x0050;
    pub const RIGHT_CLICK: u16 = 0x0051;
    pub const MIDDLE_CLICK: u16 = 0x0052;
    pub const BACK: u16 = 0x0053;
    pub const FORWARD: u16 = 0x0056;
    pub const DPI_UP: u16 = 0x004D;
    pub const DPI_DOWN: u16 = 0x004E;
    pub const NO_ACTION: u16 = 0x0000;
}

/// Physical button order used for button indices.
const BUTTON_CIDS: &[u16] = &[
    cids::LEFT_CLICK,
    cids::RIGHT_CLICK,
    cids::MIDDLE_CLICK,
    cids::BACK,
    cids::FORWARD,
    cids::DPI_UP,
];

pub fn action_to_cid(action: ButtonAction) -> u16 {
    match action {
        ButtonAction::LeftClick => cids::LEFT_CLICK,
        ButtonAction::RightClick => cids::RIGHT_CLICK,
        ButtonAction::MiddleClick => cids::MIDDLE_CLICK,
        ButtonAction::Back => cids::BACK,
        ButtonAction::Forward => cids::FORWARD,
        ButtonAction::DpiCycleUp => cids::DPI_UP,
        ButtonAction::DpiCycleDown => cids::DPI_DOWN,
        ButtonAction::NoAction => cids::NO_ACTION,
    }
}

/// Resolved feature indices of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureMap {
    pub dpi: Option<u8>,
    pub report_rate: Option<u8>,
    pub reprog: Option<u8>,
    pub onboard: Option<u8>,
}

impl FeatureMap {
    fn slot(&mut self, feature_id: u16) -> Option<&mut Option<u8>> {
        match feature_id {
            features::ADJUSTABLE_DPI => Some(&mut self.dpi),
            features::REPORT_RATE => Some(&mut self.report_rate),
            features::REPROG_CONTROLS_V4 => Some(&mut self.reprog),
            features::ONBOARD_PROFILES => Some(&mut self.onboard),
            _ => None,
        }
    }

    fn capability_of(&self, feature_index: u8) -> Option<Capability> {
        let idx = Some(feature_index);
        if feature_index == 0 {
            Some(Capability::Identify)
        } else if idx == self.dpi {
            Some(Capability::Dpi)
        } else if idx == self.report_rate {
            Some(Capability::PollingRate)
        } else if idx == self.reprog {
            Some(Capability::ButtonMapping)
        } else if idx == self.onboard {
            Some(Capability::OnboardProfiles)
        } else {
            None
        }
    }
}

const fn opcode(feature_index: u8, function: u8) -> u16 {
    ((feature_index as u16) << 8) | function as u16
}

#[derive(Debug, Clone)]
pub struct HidppCodec {
    device_index: u8,
    features: FeatureMap,
}

impl HidppCodec {
    pub fn new(device_index: u8) -> Self {
        Self {
            device_index,
            features: FeatureMap::default(),
        }
    }

    pub fn features(&self) -> &FeatureMap {
        &self.features
    }

    fn command(&self, capability: Capability, opcode: u16, params: Vec<u8>) -> ProtocolCommand {
        let len = if params.len() <= 3 {
            SHORT_REPORT_LEN
        } else {
            LONG_REPORT_LEN
        };
        ProtocolCommand::new(capability, opcode, params, len, CHECKSUM)
    }

    /// Encode into a short report if the params fit, otherwise a long one.
    pub fn encode(&self, command: &ProtocolCommand) -> Result<Vec<u8>> {
        let params = command.payload();
        let [feature_index, function] = command.opcode().to_be_bytes();
        if function > 0x0F {
            return Err(Error::protocol(format!(
                "function id 0x{function:02X} does not fit in 4 bits"
            )));
        }
        let (report_id, len) = match params.len() {
            0..=3 => (SHORT_REPORT_ID, SHORT_REPORT_LEN),
            4..=16 => (LONG_REPORT_ID, LONG_REPORT_LEN),
            n => {
                return Err(Error::protocol(format!(
                    "{n} parameter bytes exceed the 16-byte long report"
                )))
            }
        };
        let mut buf = vec![0u8; len];
        buf[0] = report_id;
        buf[1] = self.device_index;
        buf[2] = feature_index;
        buf[3] = (function << 4) | SW_ID;
        buf[4..4 + params.len()].copy_from_slice(params);
        Ok(buf)
    }

    /// Returns (feature_index, function_sw, params) of a complete frame.
    fn parse<'a>(&self, bytes: &'a [u8]) -> Result<(u8, u8, &'a [u8])> {
        let expected = match bytes[0] {
            SHORT_REPORT_ID => SHORT_REPORT_LEN,
            LONG_REPORT_ID => LONG_REPORT_LEN,
            other => return Err(Error::protocol(format!("unknown report ID: 0x{other:02X}"))),
        };
        if bytes.len() != expected {
            return Err(Error::protocol(format!(
                "frame length {} (expected {expected})",
                bytes.len()
            )));
        }
        Ok((bytes[2], bytes[3], &bytes[4..expected]))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let Some(&report_id) = bytes.first() else {
            return Ok(Decoded::Incomplete {
                needed: SHORT_REPORT_LEN,
            });
        };
        let expected = match report_id {
            SHORT_REPORT_ID => SHORT_REPORT_LEN,
            LONG_REPORT_ID => LONG_REPORT_LEN,
            other => return Err(Error::protocol(format!("unknown report ID: 0x{other:02X}"))),
        };
        if bytes.len() < expected {
            return Ok(Decoded::Incomplete {
                needed: expected - bytes.len(),
            });
        }
        let (feature_index, function_sw, params) = self.parse(bytes)?;

        if feature_index == ERROR_FEATURE_INDEX {
            // params: failing feature index, failing function_sw, error code
            let failed = opcode(params[0], params[1] >> 4);
            return Ok(Decoded::Response {
                opcode: failed,
                result: CommandResult::new(CommandStatus::Failed(params[2]), None),
            });
        }

        let op = opcode(feature_index, function_sw >> 4);
        if function_sw & 0x0F == 0 {
            return Ok(Decoded::Event(DeviceEvent {
                opcode: op,
                payload: params.to_vec(),
            }));
        }
        Ok(Decoded::Response {
            opcode: op,
            result: CommandResult::ok(params.to_vec()),
        })
    }

    pub fn decode_command(&self, frame: &[u8]) -> Result<ProtocolCommand> {
        if frame.is_empty() {
            return Err(Error::protocol("empty frame"));
        }
        let (feature_index, function_sw, params) = self.parse(frame)?;
        if function_sw & 0x0F != SW_ID {
            return Err(Error::protocol("frame does not carry our software id"));
        }
        let capability = self.features.capability_of(feature_index).ok_or_else(|| {
            Error::protocol(format!("feature index 0x{feature_index:02X} is not mapped"))
        })?;
        Ok(ProtocolCommand::new(
            capability,
            opcode(feature_index, function_sw >> 4),
            params.to_vec(),
            frame.len(),
            CHECKSUM,
        ))
    }

    /// ROOT ping (function 1); the device echoes the ping byte.
    pub fn identify(&self) -> ProtocolCommand {
        self.command(Capability::Identify, opcode(0, 1), vec![0x00, 0x00, PING_DATA])
    }

    /// One ROOT getFeature lookup per feature this crate drives.
    pub fn discovery(&self) -> Vec<ProtocolCommand> {
        [
            features::ADJUSTABLE_DPI,
            features::REPORT_RATE,
            features::REPROG_CONTROLS_V4,
            features::ONBOARD_PROFILES,
        ]
        .iter()
        .map(|id| {
            let [hi, lo] = id.to_be_bytes();
            self.command(Capability::Identify, opcode(0, 0), vec![hi, lo])
        })
        .collect()
    }

    /// Record the feature index returned by a getFeature lookup. Index 0
    /// means the device lacks the feature.
    pub fn absorb(&mut self, command: &ProtocolCommand, result: &CommandResult) {
        let (Some(&hi), Some(&lo)) = (command.payload().first(), command.payload().get(1)) else {
            return;
        };
        let feature_id = u16::from_be_bytes([hi, lo]);
        let index = match result.payload().and_then(|p| p.first()) {
            Some(&i) if result.is_ok() && i != 0 => i,
            _ => return,
        };
        if let Some(slot) = self.features.slot(feature_id) {
            *slot = Some(index);
        }
    }

    fn index_for(&self, index: Option<u8>, capability: Capability, device: &str) -> Result<u8> {
        index.ok_or_else(|| unsupported(capability, device))
    }

    /// setSensorDpi: function 2, params [sensor, dpi_hi, dpi_lo].
    pub fn set_dpi(&self, dpi: u16, device: &str) -> Result<ProtocolCommand> {
        let idx = self.index_for(self.features.dpi, Capability::Dpi, device)?;
        let [hi, lo] = dpi.to_be_bytes();
        Ok(self.command(Capability::Dpi, opcode(idx, 2), vec![0x00, hi, lo]))
    }

    /// setReportRate: function 2, params [interval_ms].
    pub fn set_polling_rate(&self, rate: PollingRate, device: &str) -> Result<ProtocolCommand> {
        let idx = self.index_for(self.features.report_rate, Capability::PollingRate, device)?;
        Ok(self.command(
            Capability::PollingRate,
            opcode(idx, 2),
            vec![rate.interval_ms()],
        ))
    }

    /// setControlReporting: function 3, params [cid, flags, remap_cid].
    pub fn set_button(
        &self,
        button: u8,
        action: ButtonAction,
        device: &str,
    ) -> Result<ProtocolCommand> {
        let idx = self.index_for(self.features.reprog, Capability::ButtonMapping, device)?;
        let cid = *BUTTON_CIDS
            .get(button as usize)
            .ok_or_else(|| unsupported(Capability::ButtonMapping, device))?;
        let [c_hi, c_lo] = cid.to_be_bytes();
        let [r_hi, r_lo] = action_to_cid(action).to_be_bytes();
        Ok(self.command(
            Capability::ButtonMapping,
            opcode(idx, 3),
            vec![c_hi, c_lo, 0x00, r_hi, r_lo],
        ))
    }

    /// setCurrentProfile: function 3, params [0, profile].
    pub fn select_profile(&self, profile: u8, device: &str) -> Result<ProtocolCommand> {
        let idx = self.index_for(self.features.onboard, Capability::OnboardProfiles, device)?;
        Ok(self.command(
            Capability::OnboardProfiles,
            opcode(idx, 3),
            vec![0x00, profile],
        ))
    }
}

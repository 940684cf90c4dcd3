//! Vendor protocol adapters.
//!
//! Every supported device family speaks its own framing over a raw HID report
//! channel. [`Adapter`] is the single capability interface the rest of the
//! crate talks to; the family-specific codecs behind it form a closed set
//! selected once, when the registry matches a device:
//!
//! | family  | frame                          | checksum          |
//! |---------|--------------------------------|-------------------|
//! | Razer   | 90-byte feature report         | XOR of bytes 2..88 |
//! | HID++   | 7-byte short / 20-byte long    | none              |
//! | Generic | 64-byte vendor report          | 8-bit additive sum |
//!
//! Decoding never panics on short input: a partial frame yields
//! [`Decoded::Incomplete`] so the caller can keep reading.

pub mod generic;
pub mod hidpp;
pub mod razer;

use crate::error::{Error, Result};
use crate::profile::{ButtonAction, PollingRate};
use crate::registry::{DeviceDescriptor, DpiRange};
use crate::safety;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A feature a device may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Identification / ping. Every adapter supports it.
    Identify,
    Dpi,
    PollingRate,
    ButtonMapping,
    OnboardProfiles,
}

impl Capability {
    pub const ALL: &'static [Capability] = &[
        Capability::Identify,
        Capability::Dpi,
        Capability::PollingRate,
        Capability::ButtonMapping,
        Capability::OnboardProfiles,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Dpi => "dpi",
            Self::PollingRate => "polling-rate",
            Self::ButtonMapping => "button-mapping",
            Self::OnboardProfiles => "onboard-profiles",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Capability flags of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Self(bits)
    }

    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub const fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.iter().copied().filter(|c| self.contains(*c))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.iter().map(|c| c.label()).collect();
        f.write_str(&labels.join(","))
    }
}

/// Checksum algorithm used by a frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    None,
    /// XOR of all covered bytes.
    Xor,
    /// 8-bit wrapping sum of all covered bytes.
    Sum8,
}

impl ChecksumKind {
    pub fn compute(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Xor => vec![bytes.iter().fold(0u8, |acc, b| acc ^ b)],
            Self::Sum8 => vec![bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))],
        }
    }
}

/// A command addressed to one device. Immutable once handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    capability: Capability,
    opcode: u16,
    payload: Vec<u8>,
    expected_response_length: usize,
    checksum_kind: ChecksumKind,
    timeout: Option<Duration>,
}

impl ProtocolCommand {
    pub fn new(
        capability: Capability,
        opcode: u16,
        payload: Vec<u8>,
        expected_response_length: usize,
        checksum_kind: ChecksumKind,
    ) -> Self {
        Self {
            capability,
            opcode,
            payload,
            expected_response_length,
            checksum_kind,
            timeout: None,
        }
    }

    /// Override the manager's default command timeout for this command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn expected_response_length(&self) -> usize {
        self.expected_response_length
    }

    /// A zero expected length marks a write the device never answers.
    pub fn expects_response(&self) -> bool {
        self.expected_response_length > 0
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum_kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Same opcode and checksum, payloads equal up to trailing zero padding.
    ///
    /// Fixed-size frames pad short payloads with zeros, so a decoded command
    /// can only be compared modulo that padding.
    pub fn is_equivalent(&self, other: &ProtocolCommand) -> bool {
        fn trimmed(p: &[u8]) -> &[u8] {
            let end = p.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
            &p[..end]
        }
        self.opcode == other.opcode
            && self.checksum_kind == other.checksum_kind
            && trimmed(&self.payload) == trimmed(&other.payload)
    }
}

/// Device-reported outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Busy,
    NotSupported,
    /// Vendor error code.
    Failed(u8),
}

/// Response correlated to exactly one issued [`ProtocolCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    status: CommandStatus,
    payload: Option<Vec<u8>>,
}

impl CommandResult {
    pub fn new(status: CommandStatus, payload: Option<Vec<u8>>) -> Self {
        Self { status, payload }
    }

    pub fn ok(payload: Vec<u8>) -> Self {
        Self::new(CommandStatus::Ok, Some(payload))
    }

    /// Result of a command that expects no response.
    pub fn sent() -> Self {
        Self::new(CommandStatus::Ok, None)
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}

/// Unsolicited report pushed by the device (button notification, wake-up...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

/// Outcome of decoding a buffer of received bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response { opcode: u16, result: CommandResult },
    Event(DeviceEvent),
    /// Not enough bytes yet; `needed` more are required for a full frame.
    Incomplete { needed: usize },
}

/// Protocol family of a descriptor plus its per-family parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ProtocolVariant {
    Razer { transaction_id: u8 },
    Hidpp { device_index: u8 },
    Generic,
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Razer { .. } => f.write_str("razer"),
            Self::Hidpp { .. } => f.write_str("hid++"),
            Self::Generic => f.write_str("generic"),
        }
    }
}

/// Value ranges a descriptor allows for writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub dpi: DpiRange,
    pub polling_rates: Vec<PollingRate>,
    pub button_count: usize,
}

/// Family-specific codec behind an [`Adapter`].
#[derive(Debug, Clone)]
pub enum Family {
    Razer(razer::RazerCodec),
    Hidpp(hidpp::HidppCodec),
    Generic(generic::GenericCodec),
}

/// Encode/decode interface for one matched device.
#[derive(Debug, Clone)]
pub struct Adapter {
    device: String,
    capabilities: Capabilities,
    limits: DeviceLimits,
    family: Family,
}

impl Adapter {
    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        let family = match descriptor.protocol {
            ProtocolVariant::Razer { transaction_id } => {
                Family::Razer(razer::RazerCodec::new(transaction_id))
            }
            ProtocolVariant::Hidpp { device_index } => {
                Family::Hidpp(hidpp::HidppCodec::new(device_index))
            }
            ProtocolVariant::Generic => Family::Generic(generic::GenericCodec::new()),
        };
        Self {
            device: descriptor.display_name.clone(),
            capabilities: descriptor.capabilities.with(Capability::Identify),
            limits: DeviceLimits {
                dpi: descriptor.dpi,
                polling_rates: descriptor.polling_rates.clone(),
                button_count: descriptor.button_count,
            },
            family,
        }
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        match &self.family {
            Family::Razer(_) => razer::CHECKSUM,
            Family::Hidpp(_) => hidpp::CHECKSUM,
            Family::Generic(_) => generic::CHECKSUM,
        }
    }

    /// Checksum bytes of this family's algorithm over `bytes`.
    pub fn checksum(&self, bytes: &[u8]) -> Vec<u8> {
        self.checksum_kind().compute(bytes)
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(Error::UnsupportedCapability {
                capability,
                device: self.device.clone(),
            })
        }
    }

    /// Encode a command into one output report.
    pub fn encode_command(&self, command: &ProtocolCommand) -> Result<Vec<u8>> {
        self.require(command.capability())?;
        if command.checksum_kind() != self.checksum_kind() {
            return Err(Error::protocol(format!(
                "checksum kind {:?} does not match {:?} framing",
                command.checksum_kind(),
                self.checksum_kind()
            )));
        }
        match &self.family {
            Family::Razer(c) => c.encode(command),
            Family::Hidpp(c) => c.encode(command),
            Family::Generic(c) => c.encode(command),
        }
    }

    /// Decode received bytes (possibly a partial frame).
    pub fn decode_report(&self, bytes: &[u8]) -> Result<Decoded> {
        match &self.family {
            Family::Razer(c) => c.decode(bytes),
            Family::Hidpp(c) => c.decode(bytes),
            Family::Generic(c) => c.decode(bytes),
        }
    }

    /// Parse an output report back into the command that produced it.
    pub fn decode_command(&self, frame: &[u8]) -> Result<ProtocolCommand> {
        match &self.family {
            Family::Razer(c) => c.decode_command(frame),
            Family::Hidpp(c) => c.decode_command(frame),
            Family::Generic(c) => c.decode_command(frame),
        }
    }

    /// Whether a decoded response answers `command`.
    pub fn response_matches(&self, command: &ProtocolCommand, opcode: u16) -> bool {
        command.opcode() == opcode
    }

    /// Lightweight round-trip used when probing a transport.
    pub fn identify_command(&self) -> ProtocolCommand {
        match &self.family {
            Family::Razer(c) => c.identify(),
            Family::Hidpp(c) => c.identify(),
            Family::Generic(c) => c.identify(),
        }
    }

    /// Commands to run once after a successful identify.
    pub fn discovery_commands(&self) -> Vec<ProtocolCommand> {
        match &self.family {
            Family::Hidpp(c) => c.discovery(),
            Family::Razer(_) | Family::Generic(_) => Vec::new(),
        }
    }

    /// Feed a discovery response back into the codec.
    pub fn absorb_discovery(&mut self, command: &ProtocolCommand, result: &CommandResult) {
        if let Family::Hidpp(c) = &mut self.family {
            c.absorb(command, result);
        }
    }

    pub fn set_dpi(&self, dpi: u16) -> Result<ProtocolCommand> {
        self.require(Capability::Dpi)?;
        let dpi = safety::validate_dpi(dpi, &self.limits.dpi)?;
        match &self.family {
            Family::Razer(c) => Ok(c.set_dpi(dpi)),
            Family::Hidpp(c) => c.set_dpi(dpi, &self.device),
            Family::Generic(c) => Ok(c.set_dpi(dpi)),
        }
    }

    pub fn set_polling_rate(&self, hz: u16) -> Result<ProtocolCommand> {
        self.require(Capability::PollingRate)?;
        let rate = safety::validate_polling_rate(hz, &self.limits.polling_rates)?;
        match &self.family {
            Family::Razer(c) => Ok(c.set_polling_rate(rate)),
            Family::Hidpp(c) => c.set_polling_rate(rate, &self.device),
            Family::Generic(c) => Ok(c.set_polling_rate(rate)),
        }
    }

    pub fn set_button_mapping(&self, button: u8, action: ButtonAction) -> Result<ProtocolCommand> {
        self.require(Capability::ButtonMapping)?;
        safety::validate_button_index(button as usize, self.limits.button_count)?;
        match &self.family {
            Family::Razer(c) => Ok(c.set_button(button, action)),
            Family::Hidpp(c) => c.set_button(button, action, &self.device),
            Family::Generic(c) => Ok(c.set_button(button, action)),
        }
    }

    pub fn select_profile(&self, profile: u8) -> Result<ProtocolCommand> {
        self.require(Capability::OnboardProfiles)?;
        match &self.family {
            Family::Razer(c) => Ok(c.select_profile(profile)),
            Family::Hidpp(c) => c.select_profile(profile, &self.device),
            Family::Generic(c) => Ok(c.select_profile(profile)),
        }
    }
}

pub(crate) fn unsupported(capability: Capability, device: &str) -> Error {
    Error::UnsupportedCapability {
        capability,
        device: device.to_string(),
    }
}

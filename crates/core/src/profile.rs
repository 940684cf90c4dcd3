//! Device settings and saved profiles.
//!
//! A [`DeviceProfile`] is a JSON document describing the settings to push to a
//! device. Every value is checked against the device's descriptor before the
//! first command is queued, so a profile is either applied completely or not
//! sent at all.

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::protocol::{Adapter, CommandResult, ProtocolCommand};
use crate::registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Polling rates understood by every supported family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(u16)]
pub enum PollingRate {
    Hz125 = 125,
    Hz250 = 250,
    Hz500 = 500,
    Hz1000 = 1000,
}

impl PollingRate {
    pub const ALL: &'static [PollingRate] = &[
        PollingRate::Hz125,
        PollingRate::Hz250,
        PollingRate::Hz500,
        PollingRate::Hz1000,
    ];

    pub fn from_hz(hz: u16) -> Option<Self> {
        match hz {
            125 => Some(Self::Hz125),
            250 => Some(Self::Hz250),
            500 => Some(Self::Hz500),
            1000 => Some(Self::Hz1000),
            _ => None,
        }
    }

    pub fn as_hz(&self) -> u16 {
        *self as u16
    }

    /// Report interval in ms: 1ms=1000Hz, 2ms=500Hz, 4ms=250Hz, 8ms=125Hz.
    pub fn interval_ms(&self) -> u8 {
        (1000 / self.as_hz()) as u8
    }
}

impl TryFrom<u16> for PollingRate {
    type Error = String;

    fn try_from(hz: u16) -> std::result::Result<Self, Self::Error> {
        Self::from_hz(hz).ok_or_else(|| format!("unsupported polling rate {hz} Hz"))
    }
}

impl From<PollingRate> for u16 {
    fn from(rate: PollingRate) -> u16 {
        rate.as_hz()
    }
}

impl std::fmt::Display for PollingRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz", self.as_hz())
    }
}

/// Standard mouse button actions for remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    LeftClick,
    RightClick,
    MiddleClick,
    Back,
    Forward,
    DpiCycleUp,
    DpiCycleDown,
    NoAction,
}

impl ButtonAction {
    pub const ALL: &'static [ButtonAction] = &[
        ButtonAction::LeftClick,
        ButtonAction::RightClick,
        ButtonAction::MiddleClick,
        ButtonAction::Back,
        ButtonAction::Forward,
        ButtonAction::DpiCycleUp,
        ButtonAction::DpiCycleDown,
        ButtonAction::NoAction,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::LeftClick => "Left Click",
            Self::RightClick => "Right Click",
            Self::MiddleClick => "Middle Click",
            Self::Back => "Back",
            Self::Forward => "Forward",
            Self::DpiCycleUp => "DPI Cycle Up",
            Self::DpiCycleDown => "DPI Cycle Down",
            Self::NoAction => "No Action",
        }
    }

    /// Action code used by the Razer and generic button assignment commands.
    pub fn wire_code(&self) -> u8 {
        match self {
            Self::NoAction => 0x00,
            Self::LeftClick => 0x01,
            Self::RightClick => 0x02,
            Self::MiddleClick => 0x03,
            Self::Back => 0x04,
            Self::Forward => 0x05,
            Self::DpiCycleUp => 0x06,
            Self::DpiCycleDown => 0x07,
        }
    }

    /// Parse a button action from a CLI-friendly string (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "left" | "left-click" | "leftclick" => Some(Self::LeftClick),
            "right" | "right-click" | "rightclick" => Some(Self::RightClick),
            "middle" | "middle-click" | "middleclick" => Some(Self::MiddleClick),
            "back" => Some(Self::Back),
            "forward" => Some(Self::Forward),
            "dpi-up" | "dpi-cycle-up" => Some(Self::DpiCycleUp),
            "dpi-down" | "dpi-cycle-down" => Some(Self::DpiCycleDown),
            "none" | "no-action" | "disabled" => Some(Self::NoAction),
            _ => None,
        }
    }
}

impl std::fmt::Display for ButtonAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A saved mouse configuration profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_rate: Option<PollingRate>,
    /// Physical button index to action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub buttons: BTreeMap<u8, ButtonAction>,
    /// Onboard profile slot to activate after the other writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboard_slot: Option<u8>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            name: "Default".into(),
            dpi: Some(800),
            polling_rate: Some(PollingRate::Hz1000),
            buttons: BTreeMap::new(),
            onboard_slot: None,
        }
    }
}

impl DeviceProfile {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid profile: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Build every command for this profile, validating all values first.
    pub fn commands(&self, adapter: &Adapter) -> Result<Vec<ProtocolCommand>> {
        let mut commands = Vec::new();
        if let Some(dpi) = self.dpi {
            commands.push(adapter.set_dpi(dpi)?);
        }
        if let Some(rate) = self.polling_rate {
            commands.push(adapter.set_polling_rate(rate.as_hz())?);
        }
        for (&button, &action) in &self.buttons {
            commands.push(adapter.set_button_mapping(button, action)?);
        }
        if let Some(slot) = self.onboard_slot {
            commands.push(adapter.select_profile(slot)?);
        }
        Ok(commands)
    }
}

/// Push a profile to a connected device.
///
/// All commands are queued before the first one is awaited, so they reach
/// the device back to back in profile order. Returns one result per command.
pub async fn apply_profile(
    manager: &ConnectionManager,
    device: &DeviceId,
    profile: &DeviceProfile,
) -> Result<Vec<CommandResult>> {
    let adapter = manager.adapter(device)?;
    let commands = profile.commands(&adapter)?;
    info!(
        device = %device,
        profile = %profile.name,
        commands = commands.len(),
        "Applying profile"
    );

    let mut pending = Vec::with_capacity(commands.len());
    for command in commands {
        pending.push(manager.submit(device, command)?);
    }

    let mut results = Vec::with_capacity(pending.len());
    for fut in pending {
        let result = fut.await?;
        if !result.is_ok() {
            warn!(device = %device, status = ?result.status(), "Profile write rejected");
        }
        results.push(result);
    }
    debug!(device = %device, "Profile applied");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{pids, vids, Registry};

    fn deathadder() -> Adapter {
        let desc = Registry::builtin()
            .match_ids(vids::RAZER, pids::DEATHADDER_V2)
            .unwrap();
        Adapter::for_descriptor(&desc)
    }

    #[test]
    fn polling_rate_roundtrip() {
        for rate in PollingRate::ALL {
            assert_eq!(PollingRate::from_hz(rate.as_hz()), Some(*rate));
        }
        assert_eq!(PollingRate::from_hz(200), None);
    }

    #[test]
    fn interval_encoding() {
        assert_eq!(PollingRate::Hz1000.interval_ms(), 1);
        assert_eq!(PollingRate::Hz500.interval_ms(), 2);
        assert_eq!(PollingRate::Hz250.interval_ms(), 4);
        assert_eq!(PollingRate::Hz125.interval_ms(), 8);
    }

    #[test]
    fn button_action_from_name_accepts_variants() {
        assert_eq!(ButtonAction::from_name("Left-Click"), Some(ButtonAction::LeftClick));
        assert_eq!(ButtonAction::from_name("dpi-down"), Some(ButtonAction::DpiCycleDown));
        assert_eq!(ButtonAction::from_name("disabled"), Some(ButtonAction::NoAction));
        assert_eq!(ButtonAction::from_name("shoot"), None);
    }

    #[test]
    fn profile_json_uses_hz_numbers() {
        let json = r#"{"name":"fps","dpi":1600,"polling_rate":500,"buttons":{"3":"forward"}}"#;
        let profile = DeviceProfile::from_json(json).unwrap();
        assert_eq!(profile.polling_rate, Some(PollingRate::Hz500));
        assert_eq!(profile.buttons.get(&3), Some(&ButtonAction::Forward));
        let back = serde_json::to_string(&profile).unwrap();
        assert!(back.contains("\"polling_rate\":500"));
    }

    #[test]
    fn profile_rejects_unknown_rate() {
        assert!(DeviceProfile::from_json(r#"{"name":"x","polling_rate":333}"#).is_err());
    }

    #[test]
    fn commands_in_profile_order() {
        let mut profile = DeviceProfile::default();
        profile.buttons.insert(4, ButtonAction::Back);
        profile.onboard_slot = Some(1);
        let cmds = profile.commands(&deathadder()).unwrap();
        let ops: Vec<u16> = cmds.iter().map(|c| c.opcode()).collect();
        assert_eq!(ops, vec![0x0405, 0x0005, 0x020C, 0x0503]);
    }

    #[test]
    fn invalid_value_builds_nothing() {
        let mut profile = DeviceProfile::default();
        profile.buttons.insert(40, ButtonAction::Back);
        assert!(matches!(
            profile.commands(&deathadder()),
            Err(Error::OutOfRange { field: "button_index", .. })
        ));
    }
}

//! Device descriptor registry.
//!
//! Maps bus identifiers to a protocol family and capability set. The builtin
//! table is loaded at startup; collaborators may [`Registry::extend`] it with
//! their own descriptors before any device is matched.

use crate::error::{Error, Result};
use crate::profile::PollingRate;
pub use crate::protocol::Capabilities;
use crate::protocol::{Capability, ProtocolVariant};
use crate::transport::TransportKind;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// USB vendor IDs of supported families.
pub mod vids {
    pub const RAZER: u16 = 0x1532;
    pub const LOGITECH: u16 = 0x046D;
    pub const STEELSERIES: u16 = 0x1038;
    pub const GLORIOUS: u16 = 0x258A;
}

/// Product IDs with dedicated descriptors.
pub mod pids {
    pub const DEATHADDER_V2: u16 = 0x0084;
    pub const VIPER_ULTIMATE: u16 = 0x0070;
    pub const BASILISK_V3: u16 = 0x0099;
    pub const DEATHADDER_V3_PRO: u16 = 0x00B6;
    /// G502 Lightspeed (wireless receiver mode).
    pub const G502_LIGHTSPEED: u16 = 0xC08D;
    /// G502 HERO (wired).
    pub const G502_HERO: u16 = 0xC08B;
    pub const G_PRO_SUPERLIGHT: u16 = 0xC094;
    pub const RIVAL_310: u16 = 0x1720;
    pub const AEROX_3: u16 = 0x1836;
}

/// Product half of a descriptor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProductMatch {
    Exact(u16),
    /// Vendor-wide fallback.
    Any,
}

impl fmt::Display for ProductMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(pid) => write!(f, "{pid:04X}"),
            Self::Any => f.write_str("*"),
        }
    }
}

/// Supported DPI range of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiRange {
    pub min: u16,
    pub max: u16,
    pub step: u16,
}

/// Static description of a supported device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product: ProductMatch,
    pub display_name: String,
    pub protocol: ProtocolVariant,
    pub capabilities: Capabilities,
    /// Transports to try, in the order they are probed.
    pub transports: Vec<TransportKind>,
    pub dpi: DpiRange,
    pub polling_rates: Vec<PollingRate>,
    pub button_count: usize,
}

impl DeviceDescriptor {
    pub fn key(&self) -> (u16, ProductMatch) {
        (self.vendor_id, self.product)
    }
}

/// Physical identity of a device: its bus transport path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of the enumeration feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub path: String,
}

impl EnumeratedDevice {
    pub fn id(&self) -> DeviceId {
        DeviceId::new(self.path.clone())
    }
}

/// Descriptor table keyed by `(vendor_id, product)`.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<(u16, ProductMatch), Arc<DeviceDescriptor>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with every builtin descriptor.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for desc in builtin_descriptors() {
            registry.entries.insert(desc.key(), Arc::new(desc));
        }
        registry
    }

    /// Add descriptors. Fails without inserting anything if a key already exists
    /// or appears twice in `descriptors`.
    pub fn extend(
        &mut self,
        descriptors: impl IntoIterator<Item = DeviceDescriptor>,
    ) -> Result<()> {
        let mut staged = BTreeMap::new();
        for desc in descriptors {
            let key = desc.key();
            if self.entries.contains_key(&key) || staged.contains_key(&key) {
                return Err(Error::DuplicateDescriptor {
                    vendor_id: desc.vendor_id,
                    product: desc.product.to_string(),
                });
            }
            staged.insert(key, Arc::new(desc));
        }
        self.entries.extend(staged);
        Ok(())
    }

    /// Most specific descriptor for a bus id pair: an exact product beats the
    /// vendor wildcard.
    pub fn match_ids(&self, vendor_id: u16, product_id: u16) -> Option<Arc<DeviceDescriptor>> {
        self.entries
            .get(&(vendor_id, ProductMatch::Exact(product_id)))
            .or_else(|| self.entries.get(&(vendor_id, ProductMatch::Any)))
            .cloned()
    }

    pub fn match_enumerated(&self, device: &EnumeratedDevice) -> Option<Arc<DeviceDescriptor>> {
        self.match_ids(device.vendor_id, device.product_id)
    }

    /// Every known descriptor, in key order. Each call starts a fresh pass.
    pub fn list_known(&self) -> impl Iterator<Item = &DeviceDescriptor> + '_ {
        self.entries.values().map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const ALL_TRANSPORTS: &[TransportKind] = &[
    TransportKind::VendorHid,
    TransportKind::GenericHid,
    TransportKind::RawUsb,
];

const FULL: Capabilities = Capabilities::of(&[
    Capability::Dpi,
    Capability::PollingRate,
    Capability::ButtonMapping,
    Capability::OnboardProfiles,
]);

const BASIC: Capabilities = Capabilities::of(&[Capability::Dpi, Capability::PollingRate]);

#[allow(clippy::too_many_arguments)]
fn descriptor(
    vendor_id: u16,
    product: ProductMatch,
    display_name: &str,
    protocol: ProtocolVariant,
    capabilities: Capabilities,
    dpi: DpiRange,
    button_count: usize,
) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product,
        display_name: display_name.to_string(),
        protocol,
        capabilities,
        transports: ALL_TRANSPORTS.to_vec(),
        dpi,
        polling_rates: PollingRate::ALL.to_vec(),
        button_count,
    }
}

fn builtin_descriptors() -> Vec<DeviceDescriptor> {
    use ProductMatch::{Any, Exact};

    // Wired Razer mice answer on transaction id 0xFF, newer ones on 0x1F.
    let razer_legacy = ProtocolVariant::Razer { transaction_id: 0xFF };
    let razer = ProtocolVariant::Razer { transaction_id: 0x1F };
    let hidpp_wired = ProtocolVariant::Hidpp { device_index: 0xFF };
    let hidpp_receiver = ProtocolVariant::Hidpp { device_index: 0x01 };

    let focus = DpiRange { min: 100, max: 20000, step: 50 };
    let focus_pro = DpiRange { min: 100, max: 30000, step: 50 };
    let hero = DpiRange { min: 100, max: 25600, step: 50 };
    let truemove = DpiRange { min: 100, max: 12000, step: 100 };
    let basic = DpiRange { min: 400, max: 3200, step: 400 };

    vec![
        descriptor(
            vids::RAZER,
            Exact(pids::DEATHADDER_V2),
            "Razer DeathAdder V2",
            razer_legacy,
            FULL,
            focus,
            8,
        ),
        descriptor(
            vids::RAZER,
            Exact(pids::VIPER_ULTIMATE),
            "Razer Viper Ultimate",
            razer,
            FULL,
            focus,
            8,
        ),
        descriptor(
            vids::RAZER,
            Exact(pids::BASILISK_V3),
            "Razer Basilisk V3",
            razer,
            FULL,
            hero,
            11,
        ),
        descriptor(
            vids::RAZER,
            Exact(pids::DEATHADDER_V3_PRO),
            "Razer DeathAdder V3 Pro",
            razer,
            FULL,
            focus_pro,
            5,
        ),
        descriptor(
            vids::RAZER,
            Any,
            "Razer mouse",
            razer_legacy,
            BASIC,
            focus,
            5,
        ),
        descriptor(
            vids::LOGITECH,
            Exact(pids::G502_LIGHTSPEED),
            "Logitech G502 Lightspeed",
            hidpp_receiver,
            FULL,
            hero,
            6,
        ),
        descriptor(
            vids::LOGITECH,
            Exact(pids::G502_HERO),
            "Logitech G502 HERO",
            hidpp_wired,
            FULL,
            hero,
            6,
        ),
        descriptor(
            vids::LOGITECH,
            Exact(pids::G_PRO_SUPERLIGHT),
            "Logitech G PRO X SUPERLIGHT",
            hidpp_receiver,
            FULL,
            hero,
            5,
        ),
        descriptor(
            vids::LOGITECH,
            Any,
            "Logitech mouse",
            hidpp_wired,
            BASIC,
            hero,
            5,
        ),
        descriptor(
            vids::STEELSERIES,
            Exact(pids::RIVAL_310),
            "SteelSeries Rival 310",
            ProtocolVariant::Generic,
            FULL,
            truemove,
            6,
        ),
        descriptor(
            vids::STEELSERIES,
            Exact(pids::AEROX_3),
            "SteelSeries Aerox 3",
            ProtocolVariant::Generic,
            FULL,
            truemove,
            6,
        ),
        descriptor(
            vids::STEELSERIES,
            Any,
            "SteelSeries mouse",
            ProtocolVariant::Generic,
            BASIC,
            truemove,
            5,
        ),
        descriptor(
            vids::GLORIOUS,
            Any,
            "Glorious mouse",
            ProtocolVariant::Generic,
            BASIC,
            basic,
            6,
        ),
    ]
}

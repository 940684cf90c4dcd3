//! HID transport abstraction for device communication.
//!
//! A [`Transport`] is a raw report channel owned by exactly one device worker
//! thread. [`TransportOpener`] creates them; the hidapi backend is the
//! production opener, and [`mock`] provides scriptable fakes for tests.

use crate::error::{Error, Result};
use crate::protocol::ProtocolVariant;
use crate::registry::{DeviceDescriptor, EnumeratedDevice};
use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Kinds of transport, in probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// The vendor-specific HID interface at the enumerated path.
    VendorHid,
    /// First HID interface matching the vendor/product pair.
    GenericHid,
    RawUsb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VendorHid => "vendor-hid",
            Self::GenericHid => "generic-hid",
            Self::RawUsb => "raw-usb",
        })
    }
}

/// Raw report channel to one device.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Write one output report.
    fn write_report(&mut self, data: &[u8]) -> Result<()>;

    /// Read the next chunk of input bytes, waiting at most `timeout`.
    /// `Ok(None)` means nothing arrived in time.
    fn read_report(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Opens transports for a matched device.
pub trait TransportOpener: Send + Sync {
    fn open(
        &self,
        device: &EnumeratedDevice,
        descriptor: &DeviceDescriptor,
        kind: TransportKind,
    ) -> Result<Box<dyn Transport>>;
}

fn map_hid_error(err: hidapi::HidError) -> Error {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        Error::PermissionDenied(msg)
    } else {
        Error::Hid(msg)
    }
}

/// Production opener backed by hidapi.
pub struct HidApiOpener {
    api: Mutex<HidApi>,
}

impl HidApiOpener {
    pub fn new() -> Result<Self> {
        let api = HidApi::new().map_err(map_hid_error)?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }

    /// List every HID interface on the bus, one entry per path.
    pub fn enumerate(&self) -> Result<Vec<EnumeratedDevice>> {
        debug!("Starting HID device enumeration");
        let mut api = self.api.lock();
        api.refresh_devices().map_err(map_hid_error)?;

        let mut devices: Vec<EnumeratedDevice> = Vec::new();
        for info in api.device_list() {
            let path = info.path().to_string_lossy().into_owned();
            if devices.iter().any(|d| d.path == path) {
                continue;
            }
            trace!(
                vid = format_args!("0x{:04X}", info.vendor_id()),
                pid = format_args!("0x{:04X}", info.product_id()),
                path = %path,
                "HID interface"
            );
            devices.push(EnumeratedDevice {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                path,
            });
        }
        debug!(count = devices.len(), "Device enumeration complete");
        Ok(devices)
    }
}

impl TransportOpener for HidApiOpener {
    fn open(
        &self,
        device: &EnumeratedDevice,
        descriptor: &DeviceDescriptor,
        kind: TransportKind,
    ) -> Result<Box<dyn Transport>> {
        let api = self.api.lock();
        let handle = match kind {
            TransportKind::VendorHid => {
                let path = CString::new(device.path.as_bytes())
                    .map_err(|_| Error::Hid(format!("invalid device path {:?}", device.path)))?;
                api.open_path(&path).map_err(map_hid_error)?
            }
            TransportKind::GenericHid => api
                .open(device.vendor_id, device.product_id)
                .map_err(map_hid_error)?,
            TransportKind::RawUsb => {
                return Err(Error::Hid(
                    "raw USB transport is not available through hidapi".into(),
                ))
            }
        };
        info!(
            device = descriptor.display_name.as_str(),
            vid = format_args!("0x{:04X}", device.vendor_id),
            pid = format_args!("0x{:04X}", device.product_id),
            kind = %kind,
            "Opened HID transport"
        );
        Ok(Box::new(HidApiTransport {
            device: handle,
            kind,
            framing: ReportFraming::for_protocol(descriptor.protocol),
            feature_pending: false,
        }))
    }
}

/// Enumerate HID devices with a throwaway hidapi context.
pub fn enumerate() -> Result<Vec<EnumeratedDevice>> {
    HidApiOpener::new()?.enumerate()
}

/// How a protocol family's frames map onto hidapi calls.
///
/// hidapi treats the first byte of every buffer as the report ID, so frames
/// that do not begin with one get an explicit `0x00` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFraming {
    /// Razer: the 90-byte command goes out and comes back as a feature report.
    Feature,
    /// HID++: the frame already starts with its report ID (0x10 or 0x11).
    Numbered,
    /// Generic: unnumbered interrupt reports.
    Unnumbered,
}

/// Wait between a feature write and the read that fetches its answer.
const FEATURE_SETTLE: Duration = Duration::from_millis(50);
const FEATURE_REPORT_LEN: usize = crate::protocol::razer::REPORT_LEN + 1;

impl ReportFraming {
    pub fn for_protocol(protocol: ProtocolVariant) -> Self {
        match protocol {
            ProtocolVariant::Razer { .. } => Self::Feature,
            ProtocolVariant::Hidpp { .. } => Self::Numbered,
            ProtocolVariant::Generic => Self::Unnumbered,
        }
    }

    /// The buffer handed to hidapi for `frame`.
    pub fn outgoing(self, frame: &[u8]) -> Vec<u8> {
        match self {
            Self::Numbered => frame.to_vec(),
            Self::Feature | Self::Unnumbered => {
                let mut buf = Vec::with_capacity(frame.len() + 1);
                buf.push(0x00);
                buf.extend_from_slice(frame);
                buf
            }
        }
    }
}

/// Drop the report ID hidapi puts in front of a feature report.
fn strip_report_id(buf: &[u8]) -> Option<Vec<u8>> {
    match buf {
        [] | [_] => None,
        [_, rest @ ..] => Some(rest.to_vec()),
    }
}

/// A transport over an open hidapi handle.
pub struct HidApiTransport {
    device: HidDevice,
    kind: TransportKind,
    framing: ReportFraming,
    /// A feature write is waiting for its answer to be fetched.
    feature_pending: bool,
}

impl Transport for HidApiTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn write_report(&mut self, data: &[u8]) -> Result<()> {
        let buf = self.framing.outgoing(data);
        match self.framing {
            ReportFraming::Feature => {
                self.device.send_feature_report(&buf).map_err(map_hid_error)?;
                self.feature_pending = true;
            }
            ReportFraming::Numbered | ReportFraming::Unnumbered => {
                self.device.write(&buf).map_err(map_hid_error)?;
            }
        }
        Ok(())
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.feature_pending {
            self.feature_pending = false;
            std::thread::sleep(timeout.min(FEATURE_SETTLE));
            let mut buf = [0u8; FEATURE_REPORT_LEN];
            let n = self
                .device
                .get_feature_report(&mut buf)
                .map_err(map_hid_error)?;
            return Ok(strip_report_id(&buf[..n.min(buf.len())]));
        }

        // Unsolicited input reports arrive on the interrupt endpoint.
        let mut buf = [0u8; 128];
        let ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        let n = self.device.read_timeout(&mut buf, ms).map_err(map_hid_error)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..n].to_vec()))
    }
}

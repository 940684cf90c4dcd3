//! Safety layer: validates all write parameters against the ranges a device's
//! descriptor allows before any command is built.
//!
//! ## Invariants
//! 1. DPI values outside the descriptor range are rejected. In-range values are
//!    rounded to the nearest step from the minimum and clamped to the range.
//! 2. Only polling rates the descriptor lists are accepted.
//! 3. Button indices are bounds-checked against the descriptor's button count.
//! 4. Validation happens before encoding, so invalid data never reaches a
//!    transport.

use crate::error::{Error, Result};
use crate::profile::PollingRate;
use crate::registry::DpiRange;

/// Include in any user-facing output about device writes.
pub const BRICKING_DISCLAIMER: &str = "\
WARNING: This software writes directly to your mouse's configuration registers. \
All writes are bounds-checked against the ranges known for your device, but \
incorrect usage or software bugs could still leave the device misconfigured. \
Firmware operations are intentionally not supported. Use at your own risk.";

/// Validate a DPI value, returning it snapped to the range's step.
pub fn validate_dpi(dpi: u16, range: &DpiRange) -> Result<u16> {
    if dpi < range.min || dpi > range.max {
        return Err(Error::OutOfRange {
            field: "dpi",
            value: dpi as u32,
            min: range.min as u32,
            max: range.max as u32,
        });
    }
    let step = range.step.max(1) as u32;
    let offset = (dpi - range.min) as u32;
    let rounded = range.min as u32 + ((offset + step / 2) / step) * step;
    Ok(rounded.min(range.max as u32) as u16)
}

/// Validate a polling rate value against the rates a device supports.
pub fn validate_polling_rate(hz: u16, supported: &[PollingRate]) -> Result<PollingRate> {
    let out_of_range = || Error::OutOfRange {
        field: "polling_rate",
        value: hz as u32,
        min: supported.iter().map(|r| r.as_hz()).min().unwrap_or(0) as u32,
        max: supported.iter().map(|r| r.as_hz()).max().unwrap_or(0) as u32,
    };
    let rate = PollingRate::from_hz(hz).ok_or_else(out_of_range)?;
    if supported.contains(&rate) {
        Ok(rate)
    } else {
        Err(out_of_range())
    }
}

/// Validate a button index (0-based).
pub fn validate_button_index(index: usize, button_count: usize) -> Result<()> {
    if index >= button_count {
        return Err(Error::OutOfRange {
            field: "button_index",
            value: index as u32,
            min: 0,
            max: button_count.saturating_sub(1) as u32,
        });
    }
    Ok(())
}

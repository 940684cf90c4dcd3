//! Where a macro is played to.

use super::model::{DeviceAction, MacroEventKind, MouseButton};
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::registry::DeviceId;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Host-side input synthesis (uinput, SendInput, CGEvent...).
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn move_by(&self, dx: i32, dy: i32) -> Result<()>;

    async fn button_down(&self, button: MouseButton) -> Result<()>;

    async fn button_up(&self, button: MouseButton) -> Result<()>;

    async fn wheel(&self, delta: i32) -> Result<()>;
}

/// Playback destination.
#[derive(Clone)]
pub enum PlaybackTarget {
    /// Input events are injected into the host. Device actions are skipped.
    Host(Arc<dyn InputInjector>),
    /// Device actions go through the connection manager. Input events are
    /// skipped.
    Device {
        manager: Arc<ConnectionManager>,
        device: DeviceId,
    },
}

impl PlaybackTarget {
    /// Emit one event. Returns false when this target has nothing to do for it.
    pub(crate) async fn emit(&self, kind: &MacroEventKind) -> Result<bool> {
        match (self, *kind) {
            (_, MacroEventKind::Delay { .. }) => Ok(false),
            (Self::Host(inj), MacroEventKind::Move { dx, dy }) => {
                inj.move_by(dx, dy).await.map(|_| true)
            }
            (Self::Host(inj), MacroEventKind::ButtonDown { button }) => {
                inj.button_down(button).await.map(|_| true)
            }
            (Self::Host(inj), MacroEventKind::ButtonUp { button }) => {
                inj.button_up(button).await.map(|_| true)
            }
            (Self::Host(inj), MacroEventKind::Wheel { delta }) => {
                inj.wheel(delta).await.map(|_| true)
            }
            (Self::Host(_), MacroEventKind::Device { action }) => {
                debug!(?action, "Skipping device action on host target");
                Ok(false)
            }
            (Self::Device { manager, device }, MacroEventKind::Device { action }) => {
                run_device_action(manager, device, action).await.map(|_| true)
            }
            (Self::Device { .. }, _) => Ok(false),
        }
    }

    /// Release a button left held by an interrupted pass.
    pub(crate) async fn release(&self, button: MouseButton) -> Result<()> {
        match self {
            Self::Host(inj) => inj.button_up(button).await,
            Self::Device { .. } => Ok(()),
        }
    }
}

async fn run_device_action(
    manager: &ConnectionManager,
    device: &DeviceId,
    action: DeviceAction,
) -> Result<()> {
    let adapter = manager.adapter(device)?;
    let command = match action {
        DeviceAction::SetDpi { dpi } => adapter.set_dpi(dpi)?,
        DeviceAction::SetPollingRate { hz } => adapter.set_polling_rate(hz)?,
        DeviceAction::SelectProfile { slot } => adapter.select_profile(slot)?,
    };
    let result = manager.execute(device, command).await?;
    if !result.is_ok() {
        warn!(device = %device, ?action, status = ?result.status(), "Device rejected macro action");
        return Err(Error::protocol(format!(
            "device rejected {action:?} with {:?}",
            result.status()
        )));
    }
    Ok(())
}

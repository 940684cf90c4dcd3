//! open-mouse CLI: probe and configure mice from the command line.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use open_mouse_core::macros::{Macro, MacroEventKind};
use open_mouse_core::profile::{apply_profile, ButtonAction, DeviceProfile};
use open_mouse_core::transport::HidApiOpener;
use open_mouse_core::{
    CommandResult, ConnectionManager, CoreConfig, CoreContext, DeviceId, EnumeratedDevice,
    ProtocolCommand, Registry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "open-mouse",
    version,
    about = "Open-source gaming mouse configuration"
)]
struct Cli {
    /// JSON file with core settings (timeouts, retry budget, playback speed).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// HID path of the device to use. Defaults to the first supported device.
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every device the registry knows about.
    ListKnown,
    /// Scan the HID bus and show which devices are supported.
    Scan,
    /// Connect to a device and report what it negotiated.
    Probe,
    /// Set DPI (rounded to the sensor's step).
    SetDpi {
        /// DPI value to set.
        value: u16,
    },
    /// Set polling rate (125, 250, 500, or 1000 Hz).
    SetRate {
        /// Polling rate in Hz.
        value: u16,
    },
    /// Remap a button.
    SetButton {
        /// Button index.
        index: u8,
        /// Action: left, right, middle, back, forward, dpi-up, dpi-down, none.
        action: String,
    },
    /// Apply a JSON profile file.
    ApplyProfile {
        path: PathBuf,
    },
    /// Print the events of a macro file.
    MacroShow {
        path: PathBuf,
    },
    /// Thin out recorded movement in a macro file.
    MacroOptimize {
        path: PathBuf,
        /// Write here instead of overwriting the input.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(CoreConfig::default()),
    }
}

/// An open session on one device, released on `close`.
struct Session {
    manager: ConnectionManager,
    id: DeviceId,
}

impl Session {
    async fn open(config: CoreConfig, wanted: Option<&str>) -> Result<Self> {
        let registry = Arc::new(Registry::builtin());
        let opener = HidApiOpener::new()?;
        let candidates = opener.enumerate()?;
        let device = pick_device(&registry, &candidates, wanted)?;
        tracing::debug!(path = %device.path, "Selected device");

        let manager = ConnectionManager::new(registry, Arc::new(opener), CoreContext::new(config));
        let id = manager
            .connect(&device)
            .await
            .with_context(|| format!("connecting to {}", device.path))?;
        Ok(Self { manager, id })
    }

    async fn run(&self, command: ProtocolCommand) -> Result<CommandResult> {
        let result = self.manager.execute(&self.id, command).await?;
        if !result.is_ok() {
            return Err(anyhow!("device answered {:?}", result.status()));
        }
        Ok(result)
    }

    async fn close(self) -> Result<()> {
        self.manager.disconnect(&self.id).await?;
        Ok(())
    }
}

fn pick_device(
    registry: &Registry,
    candidates: &[EnumeratedDevice],
    wanted: Option<&str>,
) -> Result<EnumeratedDevice> {
    let mut supported = candidates
        .iter()
        .filter(|d| registry.match_enumerated(d).is_some());
    let found = match wanted {
        Some(path) => supported.find(|d| d.path == path),
        None => supported.next(),
    };
    found.cloned().ok_or_else(|| match wanted {
        Some(path) => anyhow!("no supported device at {path}"),
        None => anyhow!(
            "No supported mouse found. Ensure it is connected and udev rules are installed."
        ),
    })
}

fn print_macro(m: &Macro) {
    println!(
        "{} ({} events, {} ms per pass, repeat {})",
        m.name(),
        m.events().len(),
        m.duration_ms(),
        m.repeat_count()
    );
    for event in m.events() {
        let what = match event.kind {
            MacroEventKind::Move { dx, dy } => format!("move {dx:+} {dy:+}"),
            MacroEventKind::ButtonDown { button } => format!("down {button:?}"),
            MacroEventKind::ButtonUp { button } => format!("up {button:?}"),
            MacroEventKind::Wheel { delta } => format!("wheel {delta:+}"),
            MacroEventKind::Delay { ms } => format!("delay {ms} ms"),
            MacroEventKind::Device { action } => format!("device {action:?}"),
        };
        println!("  {:>7} ms  {what}", event.offset_ms);
    }
}

fn read_macro(path: &Path) -> Result<Macro> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Macro::from_json(&text)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let wanted = cli.device.as_deref();

    match cli.command {
        Commands::ListKnown => {
            for desc in Registry::builtin().list_known() {
                println!(
                    "{:04X}:{} {} [{}] {}",
                    desc.vendor_id,
                    desc.product,
                    desc.display_name,
                    desc.protocol,
                    desc.capabilities
                );
            }
        }
        Commands::Scan => {
            let registry = Registry::builtin();
            let devices = HidApiOpener::new()?.enumerate()?;
            let mut any = false;
            for dev in &devices {
                if let Some(desc) = registry.match_enumerated(dev) {
                    any = true;
                    println!(
                        "{} (VID: 0x{:04X}, PID: 0x{:04X}, path: {})",
                        desc.display_name, dev.vendor_id, dev.product_id, dev.path
                    );
                }
            }
            if !any {
                println!("No supported mice found.");
                println!("Ensure your mouse is connected and drivers are set up.");
            }
        }
        Commands::Probe => {
            let session = Session::open(config, wanted).await?;
            let desc = session.manager.descriptor(&session.id)?;
            let adapter = session.manager.adapter(&session.id)?;
            let metrics = session.manager.metrics(&session.id)?;
            println!("{} at {}", desc.display_name, session.id);
            println!("  protocol: {}", desc.protocol);
            println!("  capabilities: {}", adapter.capabilities());
            println!(
                "  DPI: {}-{} (step {})",
                desc.dpi.min, desc.dpi.max, desc.dpi.step
            );
            println!("  state: {}", session.manager.state(&session.id));
            println!("  metrics: {}", serde_json::to_string(&metrics)?);
            session.close().await?;
        }
        Commands::SetDpi { value } => {
            eprintln!("{}", open_mouse_core::safety::BRICKING_DISCLAIMER);
            let session = Session::open(config, wanted).await?;
            let command = session.manager.adapter(&session.id)?.set_dpi(value)?;
            session.run(command).await?;
            println!("DPI set on {}", session.id);
            session.close().await?;
        }
        Commands::SetRate { value } => {
            eprintln!("{}", open_mouse_core::safety::BRICKING_DISCLAIMER);
            let session = Session::open(config, wanted).await?;
            let command = session.manager.adapter(&session.id)?.set_polling_rate(value)?;
            session.run(command).await?;
            println!("Polling rate set to {value} Hz");
            session.close().await?;
        }
        Commands::SetButton { index, action } => {
            let parsed = ButtonAction::from_name(&action).ok_or_else(|| {
                anyhow!(
                    "Unknown button action '{}'. Valid actions: left, right, middle, back, forward, dpi-up, dpi-down, none",
                    action
                )
            })?;
            eprintln!("{}", open_mouse_core::safety::BRICKING_DISCLAIMER);
            let session = Session::open(config, wanted).await?;
            let command = session
                .manager
                .adapter(&session.id)?
                .set_button_mapping(index, parsed)?;
            session.run(command).await?;
            println!("Set button {index} to '{}'", parsed.label());
            session.close().await?;
        }
        Commands::ApplyProfile { path } => {
            let profile = DeviceProfile::load(&path)?;
            eprintln!("{}", open_mouse_core::safety::BRICKING_DISCLAIMER);
            let session = Session::open(config, wanted).await?;
            let results = apply_profile(&session.manager, &session.id, &profile).await?;
            let rejected = results.iter().filter(|r| !r.is_ok()).count();
            println!(
                "Applied profile '{}': {} writes, {} rejected",
                profile.name,
                results.len(),
                rejected
            );
            session.close().await?;
            if rejected > 0 {
                return Err(anyhow!("{rejected} profile writes were rejected"));
            }
        }
        Commands::MacroShow { path } => {
            print_macro(&read_macro(&path)?);
        }
        Commands::MacroOptimize { path, output } => {
            let original = read_macro(&path)?;
            let optimized = original.optimized();
            let target = output.unwrap_or(path);
            std::fs::write(&target, optimized.to_json()?)
                .with_context(|| format!("writing {}", target.display()))?;
            println!(
                "{}: {} -> {} events, written to {}",
                original.name(),
                original.events().len(),
                optimized.events().len(),
                target.display()
            );
        }
    }

    Ok(())
}

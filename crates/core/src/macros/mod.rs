//! Macro recording and playback.

pub mod model;
pub mod player;
pub mod recorder;
pub mod target;

pub use model::{DeviceAction, Macro, MacroBuilder, MacroEvent, MacroEventKind, MouseButton};
pub use player::{MacroPlayer, PlaybackSummary, PlayerConfig};
pub use recorder::{InputEvent, InputFeed, MacroRecorder, RecorderConfig, RecorderStats, Recording};
pub use target::{InputInjector, PlaybackTarget};

//! Macro data model and its JSON form.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Pointer button identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
    /// Platform button code without a name.
    Other(u16),
}

/// Device-side action a macro can trigger mid-sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceAction {
    SetDpi { dpi: u16 },
    SetPollingRate { hz: u16 },
    SelectProfile { slot: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MacroEventKind {
    Move { dx: i32, dy: i32 },
    ButtonDown { button: MouseButton },
    ButtonUp { button: MouseButton },
    Wheel { delta: i32 },
    /// Idle time; only meaningful as the last event of a pass.
    Delay { ms: u32 },
    Device { action: DeviceAction },
}

impl MacroEventKind {
    pub fn is_transition(&self) -> bool {
        matches!(self, Self::ButtonDown { .. } | Self::ButtonUp { .. })
    }
}

/// One timed event, `offset_ms` from the start of the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroEvent {
    pub offset_ms: u32,
    #[serde(flatten)]
    pub kind: MacroEventKind,
}

impl MacroEvent {
    pub fn new(offset_ms: u32, kind: MacroEventKind) -> Self {
        Self { offset_ms, kind }
    }

    /// Time this event occupies, counted from its own offset.
    fn end_ms(&self) -> u64 {
        match self.kind {
            MacroEventKind::Delay { ms } => self.offset_ms as u64 + ms as u64,
            _ => self.offset_ms as u64,
        }
    }
}

/// A recorded or authored input sequence.
///
/// Offsets are non-decreasing and the first event sits at 0. Both are checked
/// when a macro is constructed or deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MacroRepr")]
pub struct Macro {
    name: String,
    repeat_count: u32,
    /// Unix time in ms.
    created_at: u64,
    events: Vec<MacroEvent>,
}

#[derive(Deserialize)]
struct MacroRepr {
    name: String,
    #[serde(default = "one")]
    repeat_count: u32,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    events: Vec<MacroEvent>,
}

fn one() -> u32 {
    1
}

impl TryFrom<MacroRepr> for Macro {
    type Error = Error;

    fn try_from(repr: MacroRepr) -> Result<Self> {
        if let Some(first) = repr.events.first() {
            if first.offset_ms != 0 {
                return Err(Error::Macro(format!(
                    "first event must be at offset 0, found {}",
                    first.offset_ms
                )));
            }
        }
        if let Some(i) = repr
            .events
            .windows(2)
            .position(|w| w[1].offset_ms < w[0].offset_ms)
        {
            return Err(Error::Macro(format!(
                "event {} goes back in time ({} < {})",
                i + 1,
                repr.events[i + 1].offset_ms,
                repr.events[i].offset_ms
            )));
        }
        Ok(Self {
            name: repr.name,
            repeat_count: repr.repeat_count,
            created_at: repr.created_at,
            events: repr.events,
        })
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Stable-sort by offset and shift so the first event lands on 0.
fn normalize(mut events: Vec<MacroEvent>) -> Vec<MacroEvent> {
    events.sort_by_key(|e| e.offset_ms);
    if let Some(base) = events.first().map(|e| e.offset_ms) {
        for e in &mut events {
            e.offset_ms -= base;
        }
    }
    events
}

impl Macro {
    /// Build a macro from events in any order.
    pub fn from_events(name: impl Into<String>, events: Vec<MacroEvent>) -> Self {
        Self {
            name: name.into(),
            repeat_count: 1,
            created_at: now_unix_ms(),
            events: normalize(events),
        }
    }

    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default repeat count stored with the macro. 0 means infinite.
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn events(&self) -> &[MacroEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Length of one pass, including a trailing delay.
    pub fn duration_ms(&self) -> u64 {
        self.events.iter().map(MacroEvent::end_ms).max().unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Macro(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Macro(format!("invalid macro: {e}")))
    }

    /// Thin out recorded movement.
    ///
    /// A move is folded into the next kept move when its accumulated delta is
    /// below 2 on both axes or it lands within 10 ms of the previous kept
    /// event. Total displacement is preserved: pending movement is flushed
    /// before every non-move event and at the end. Non-move events are never
    /// dropped.
    pub fn optimized(&self) -> Macro {
        const MIN_DELTA: u32 = 2;
        const MIN_GAP_MS: u32 = 10;

        let mut out: Vec<MacroEvent> = Vec::with_capacity(self.events.len());
        let mut carry = (0i32, 0i32);

        for event in &self.events {
            match event.kind {
                MacroEventKind::Move { dx, dy } => {
                    carry = (carry.0.saturating_add(dx), carry.1.saturating_add(dy));
                    let tiny =
                        carry.0.unsigned_abs() < MIN_DELTA && carry.1.unsigned_abs() < MIN_DELTA;
                    let close = out
                        .last()
                        .is_some_and(|prev| event.offset_ms - prev.offset_ms < MIN_GAP_MS);
                    if !out.is_empty() && (tiny || close) {
                        continue;
                    }
                    out.push(MacroEvent::new(
                        event.offset_ms,
                        MacroEventKind::Move {
                            dx: carry.0,
                            dy: carry.1,
                        },
                    ));
                    carry = (0, 0);
                }
                kind => {
                    if carry != (0, 0) {
                        out.push(MacroEvent::new(
                            event.offset_ms,
                            MacroEventKind::Move {
                                dx: carry.0,
                                dy: carry.1,
                            },
                        ));
                        carry = (0, 0);
                    }
                    out.push(MacroEvent::new(event.offset_ms, kind));
                }
            }
        }
        if carry != (0, 0) {
            let at = self.events.last().map_or(0, |e| e.offset_ms);
            out.push(MacroEvent::new(
                at,
                MacroEventKind::Move {
                    dx: carry.0,
                    dy: carry.1,
                },
            ));
        }

        Macro {
            name: self.name.clone(),
            repeat_count: self.repeat_count,
            created_at: self.created_at,
            events: out,
        }
    }
}

/// Hand-authoring helper: events are appended at a moving cursor.
#[derive(Debug, Clone)]
pub struct MacroBuilder {
    name: String,
    cursor_ms: u32,
    events: Vec<MacroEvent>,
}

impl MacroBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cursor_ms: 0,
            events: Vec::new(),
        }
    }

    /// Advance the cursor without emitting anything. Saturates at `u32::MAX`.
    pub fn wait(mut self, ms: u32) -> Self {
        self.cursor_ms = self.cursor_ms.saturating_add(ms);
        self
    }

    pub fn event(mut self, kind: MacroEventKind) -> Self {
        self.events.push(MacroEvent::new(self.cursor_ms, kind));
        self
    }

    pub fn move_by(self, dx: i32, dy: i32) -> Self {
        self.event(MacroEventKind::Move { dx, dy })
    }

    pub fn press(self, button: MouseButton) -> Self {
        self.event(MacroEventKind::ButtonDown { button })
    }

    pub fn release(self, button: MouseButton) -> Self {
        self.event(MacroEventKind::ButtonUp { button })
    }

    pub fn click(self, button: MouseButton, hold_ms: u32) -> Self {
        self.press(button).wait(hold_ms).release(button)
    }

    pub fn wheel(self, delta: i32) -> Self {
        self.event(MacroEventKind::Wheel { delta })
    }

    pub fn device(self, action: DeviceAction) -> Self {
        self.event(MacroEventKind::Device { action })
    }

    /// Idle time at the end of the pass, recorded as a `Delay` event.
    pub fn trailing_delay(self, ms: u32) -> Self {
        self.event(MacroEventKind::Delay { ms })
    }

    pub fn build(self) -> Macro {
        Macro::from_events(self.name, self.events)
    }
}

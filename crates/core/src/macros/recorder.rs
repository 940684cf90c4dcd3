//! Macro capture.
//!
//! Input hooks push into an [`InputFeed`] without blocking. Movement goes
//! through a bounded queue and is dropped (and counted) when the queue is
//! full; button transitions have their own unbounded queue and are never
//! dropped. A capture task drains both into a buffer, merging moves that fall
//! into the same rate bucket.

use super::model::{Macro, MacroEvent, MacroEventKind, MouseButton};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Buffer cap. Moves beyond it are dropped, transitions are still kept.
    pub max_events: usize,
    /// Moves are merged down to at most this many per second.
    pub max_move_rate_hz: u32,
    /// Capacity of the movement queue between hooks and the capture task.
    pub move_queue_depth: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_move_rate_hz: 125,
            move_queue_depth: 1024,
        }
    }
}

/// Raw input as delivered by a host hook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub at: Instant,
    pub kind: MacroEventKind,
}

impl InputEvent {
    pub fn now(kind: MacroEventKind) -> Self {
        Self {
            at: Instant::now(),
            kind,
        }
    }
}

#[derive(Debug, Default)]
struct StatsCell {
    events_seen: AtomicU64,
    events_recorded: AtomicU64,
    moves_coalesced: AtomicU64,
    moves_dropped: AtomicU64,
}

impl StatsCell {
    fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            events_recorded: self.events_recorded.load(Ordering::Relaxed),
            moves_coalesced: self.moves_coalesced.load(Ordering::Relaxed),
            moves_dropped: self.moves_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one recording session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub events_seen: u64,
    pub events_recorded: u64,
    pub moves_coalesced: u64,
    pub moves_dropped: u64,
}

/// Hook-side handle. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct InputFeed {
    moves: mpsc::Sender<InputEvent>,
    others: mpsc::UnboundedSender<InputEvent>,
    stats: Arc<StatsCell>,
}

impl InputFeed {
    /// Returns false when the event was dropped or the recording is over.
    pub fn push(&self, event: InputEvent) -> bool {
        if let MacroEventKind::Move { .. } = event.kind {
            match self.moves.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.moves_dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            self.others.send(event).is_ok()
        }
    }

    pub fn move_by(&self, dx: i32, dy: i32) -> bool {
        self.push(InputEvent::now(MacroEventKind::Move { dx, dy }))
    }

    pub fn button_down(&self, button: MouseButton) -> bool {
        self.push(InputEvent::now(MacroEventKind::ButtonDown { button }))
    }

    pub fn button_up(&self, button: MouseButton) -> bool {
        self.push(InputEvent::now(MacroEventKind::ButtonUp { button }))
    }

    pub fn wheel(&self, delta: i32) -> bool {
        self.push(InputEvent::now(MacroEventKind::Wheel { delta }))
    }
}

/// Starts recordings. Only one may be active per recorder.
#[derive(Debug)]
pub struct MacroRecorder {
    config: RecorderConfig,
    active: Arc<AtomicBool>,
}

impl MacroRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Begin capturing. Must be called inside a tokio runtime.
    pub fn start(&self, name: impl Into<String>) -> Result<(Recording, InputFeed)> {
        let name = name.into();
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Macro(format!(
                "cannot start '{name}': a recording is already in progress"
            )));
        }

        let stats = Arc::new(StatsCell::default());
        let (moves_tx, moves_rx) = mpsc::channel(self.config.move_queue_depth.max(1));
        let (others_tx, others_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let started_at = Instant::now();

        let buffer = CaptureBuffer::new(started_at, &self.config, stats.clone());
        let task = tokio::spawn(capture(buffer, moves_rx, others_rx, stop_rx));

        info!(name = %name, "Recording started");
        let recording = Recording {
            name,
            started_at,
            stop: Some(stop_tx),
            task: Some(task),
            stats: stats.clone(),
            active: self.active.clone(),
        };
        let feed = InputFeed {
            moves: moves_tx,
            others: others_tx,
            stats,
        };
        Ok((recording, feed))
    }
}

/// A running capture session.
#[derive(Debug)]
pub struct Recording {
    name: String,
    started_at: Instant,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Vec<MacroEvent>>>,
    stats: Arc<StatsCell>,
    active: Arc<AtomicBool>,
}

impl Recording {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offsets are measured from this instant.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats.snapshot()
    }

    /// Finish the recording. Everything pushed before this call is included.
    pub async fn stop(mut self) -> Result<Macro> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let task = self
            .task
            .take()
            .ok_or_else(|| Error::Macro("recording already finished".into()))?;
        let events = task
            .await
            .map_err(|e| Error::Macro(format!("capture task failed: {e}")))?;
        let stats = self.stats.snapshot();
        info!(
            name = %self.name,
            events = events.len(),
            coalesced = stats.moves_coalesced,
            dropped = stats.moves_dropped,
            "Recording stopped"
        );
        if stats.moves_dropped > 0 {
            warn!(
                name = %self.name,
                dropped = stats.moves_dropped,
                "Movement was dropped during capture"
            );
        }
        Ok(Macro::from_events(self.name.clone(), events))
    }

    /// Discard the recording.
    pub fn cancel(self) {
        debug!(name = %self.name, "Recording cancelled");
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.active.store(false, Ordering::Release);
    }
}

struct CaptureBuffer {
    started_at: Instant,
    bucket_ms: u32,
    max_events: usize,
    events: Vec<MacroEvent>,
    /// Latest offset of any buffered non-move event.
    last_transition_ms: Option<u32>,
    stats: Arc<StatsCell>,
}

impl CaptureBuffer {
    fn new(started_at: Instant, config: &RecorderConfig, stats: Arc<StatsCell>) -> Self {
        Self {
            started_at,
            bucket_ms: (1000 / config.max_move_rate_hz.max(1)).max(1),
            max_events: config.max_events,
            events: Vec::new(),
            last_transition_ms: None,
            stats,
        }
    }

    fn push(&mut self, input: InputEvent) {
        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
        let offset_ms = input
            .at
            .saturating_duration_since(self.started_at)
            .as_millis()
            .min(u32::MAX as u128) as u32;

        if let MacroEventKind::Move { dx, dy } = input.kind {
            let barrier = self.last_transition_ms;
            let bucket_ms = self.bucket_ms;
            if let Some(last) = self.events.last_mut() {
                // Transitions are drained ahead of moves, so a merge is only
                // safe when nothing else happened at or after the tail move.
                let clear = barrier.is_none_or(|t| t < last.offset_ms);
                if let MacroEventKind::Move { dx: ldx, dy: ldy } = &mut last.kind {
                    if clear && last.offset_ms / bucket_ms == offset_ms / bucket_ms {
                        *ldx = ldx.saturating_add(dx);
                        *ldy = ldy.saturating_add(dy);
                        self.stats.moves_coalesced.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            if self.events.len() >= self.max_events {
                self.stats.moves_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        } else {
            let latest = self.last_transition_ms.map_or(offset_ms, |t| t.max(offset_ms));
            self.last_transition_ms = Some(latest);
        }

        self.events.push(MacroEvent::new(offset_ms, input.kind));
        self.stats.events_recorded.fetch_add(1, Ordering::Relaxed);
    }
}

async fn capture(
    mut buffer: CaptureBuffer,
    mut moves: mpsc::Receiver<InputEvent>,
    mut others: mpsc::UnboundedReceiver<InputEvent>,
    mut stop: oneshot::Receiver<()>,
) -> Vec<MacroEvent> {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            Some(event) = others.recv() => buffer.push(event),
            Some(event) = moves.recv() => buffer.push(event),
            else => {
                // Every feed is gone; hold the buffer until stop.
                let _ = (&mut stop).await;
                break;
            }
        }
    }
    while let Ok(event) = others.try_recv() {
        buffer.push(event);
    }
    while let Ok(event) = moves.try_recv() {
        buffer.push(event);
    }
    buffer.events
}

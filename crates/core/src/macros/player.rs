//! Macro playback.
//!
//! Each event is scheduled against an absolute deadline (`anchor + offset`),
//! so the time spent emitting one event does not push back the ones after it.

use super::model::{Macro, MacroEventKind, MouseButton};
use super::target::PlaybackTarget;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// A pass that ends this late restarts its clock instead of catching up.
const LATE_RESET: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Playback speed multiplier. 2.0 plays twice as fast.
    pub speed: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}

/// Outcome of one `play` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackSummary {
    pub passes_completed: u32,
    pub events_emitted: u64,
    pub cancelled: bool,
    /// Buttons that were still down when playback ended and got released.
    pub released_buttons: Vec<MouseButton>,
}

/// Plays one macro. A given player runs at most one playback at a time.
pub struct MacroPlayer {
    macro_: Arc<Macro>,
    config: PlayerConfig,
    /// Guards both the running flag and resets of `cancel`.
    running: Mutex<bool>,
    cancel: watch::Sender<bool>,
}

struct RunningGuard<'a>(&'a Mutex<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = false;
    }
}

impl MacroPlayer {
    pub fn new(macro_: Arc<Macro>, config: PlayerConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            macro_,
            config,
            running: Mutex::new(false),
            cancel,
        }
    }

    pub fn macro_(&self) -> &Macro {
        &self.macro_
    }

    pub fn is_playing(&self) -> bool {
        *self.running.lock()
    }

    /// Stop the current playback before its next event.
    pub fn cancel(&self) {
        let running = self.running.lock();
        if *running {
            self.cancel.send_replace(true);
        }
    }

    fn scaled(&self, ms: u64) -> Duration {
        let speed = if self.config.speed > 0.0 { self.config.speed } else { 1.0 };
        Duration::from_secs_f64(ms as f64 / 1000.0 / speed)
    }

    /// Play `repeat_count` passes; 0 repeats until cancelled. Buttons pressed
    /// by the macro are released on every exit path.
    pub async fn play(
        &self,
        repeat_count: u32,
        target: &PlaybackTarget,
    ) -> Result<PlaybackSummary> {
        let mut cancel = {
            let mut running = self.running.lock();
            if *running {
                return Err(Error::AlreadyPlaying(self.macro_.name().to_string()));
            }
            self.cancel.send_replace(false);
            *running = true;
            self.cancel.subscribe()
        };
        let _guard = RunningGuard(&self.running);

        info!(
            name = %self.macro_.name(),
            repeat_count,
            speed = self.config.speed,
            "Playback started"
        );
        let mut summary = PlaybackSummary::default();
        let mut held = Vec::new();
        let outcome = self
            .run(repeat_count, target, &mut cancel, &mut held, &mut summary)
            .await;

        for button in held.into_iter().rev() {
            match target.release(button).await {
                Ok(()) => summary.released_buttons.push(button),
                Err(err) => warn!(?button, error = %err, "Failed to release held button"),
            }
        }

        match &outcome {
            Ok(()) => info!(
                name = %self.macro_.name(),
                passes = summary.passes_completed,
                events = summary.events_emitted,
                cancelled = summary.cancelled,
                "Playback finished"
            ),
            Err(err) => warn!(name = %self.macro_.name(), error = %err, "Playback failed"),
        }
        outcome.map(|()| summary)
    }

    async fn run(
        &self,
        repeat_count: u32,
        target: &PlaybackTarget,
        cancel: &mut watch::Receiver<bool>,
        held: &mut Vec<MouseButton>,
        summary: &mut PlaybackSummary,
    ) -> Result<()> {
        if self.macro_.is_empty() {
            return Ok(());
        }
        let pass_len = self.scaled(self.macro_.duration_ms());
        let mut anchor = Instant::now();

        while repeat_count == 0 || summary.passes_completed < repeat_count {
            for event in self.macro_.events() {
                let due = anchor + self.scaled(event.offset_ms as u64);
                if wait_until(due, cancel).await {
                    summary.cancelled = true;
                    return Ok(());
                }
                // A failed release keeps the button in `held` for cleanup.
                if !target.emit(&event.kind).await? {
                    continue;
                }
                summary.events_emitted += 1;
                match event.kind {
                    MacroEventKind::ButtonDown { button } if !held.contains(&button) => {
                        held.push(button)
                    }
                    MacroEventKind::ButtonUp { button } => held.retain(|b| *b != button),
                    _ => {}
                }
            }

            let end = anchor + pass_len;
            if wait_until(end, cancel).await {
                summary.cancelled = true;
                return Ok(());
            }
            summary.passes_completed += 1;
            debug!(pass = summary.passes_completed, "Pass complete");

            let now = Instant::now();
            anchor = if now > end + LATE_RESET { now } else { end };
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Sleep until `due`. Returns true if cancelled first.
async fn wait_until(due: Instant, cancel: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *cancel.borrow_and_update() {
            return true;
        }
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() {
                    sleep_until(due).await;
                    return false;
                }
            }
            _ = sleep_until(due) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::model::MacroBuilder;
    use crate::macros::target::InputInjector;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Injected {
        Move(i32, i32),
        Down(MouseButton),
        Up(MouseButton),
        Wheel(i32),
    }

    /// Records what was injected and when, optionally stalling on each call.
    struct RecordingInjector {
        start: Instant,
        jitter_ms: Vec<u64>,
        log: Mutex<Vec<(Duration, Injected)>>,
        /// This many `button_up` calls fail before the rest succeed.
        failing_ups: AtomicUsize,
    }

    impl RecordingInjector {
        fn new(jitter_ms: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                jitter_ms,
                log: Mutex::new(Vec::new()),
                failing_ups: AtomicUsize::new(0),
            })
        }

        fn failing_ups(n: usize) -> Arc<Self> {
            let inj = Self::new(vec![]);
            inj.failing_ups.store(n, Ordering::SeqCst);
            inj
        }

        fn count(&self, what: &Injected) -> usize {
            self.log.lock().iter().filter(|(_, e)| e == what).count()
        }

        async fn record(&self, what: Injected) -> Result<()> {
            let n = {
                let mut log = self.log.lock();
                log.push((self.start.elapsed(), what));
                log.len()
            };
            if let Some(ms) = self.jitter_ms.get((n - 1) % self.jitter_ms.len().max(1)) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            Ok(())
        }

        fn log(&self) -> Vec<(Duration, Injected)> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl InputInjector for RecordingInjector {
        async fn move_by(&self, dx: i32, dy: i32) -> Result<()> {
            self.record(Injected::Move(dx, dy)).await
        }

        async fn button_down(&self, button: MouseButton) -> Result<()> {
            self.record(Injected::Down(button)).await
        }

        async fn button_up(&self, button: MouseButton) -> Result<()> {
            self.record(Injected::Up(button)).await?;
            let failing = self
                .failing_ups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match failing {
                Ok(_) => Err(Error::Hid("transient".into())),
                Err(_) => Ok(()),
            }
        }

        async fn wheel(&self, delta: i32) -> Result<()> {
            self.record(Injected::Wheel(delta)).await
        }
    }

    fn player(m: Macro) -> Arc<MacroPlayer> {
        Arc::new(MacroPlayer::new(Arc::new(m), PlayerConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn events_fire_on_schedule_despite_slow_injector() {
        let m = MacroBuilder::new("timing")
            .move_by(1, 0)
            .wait(50)
            .move_by(2, 0)
            .wait(70)
            .wheel(1)
            .build();
        let inj = RecordingInjector::new(vec![7, 10, 3]);
        let target = PlaybackTarget::Host(inj.clone());

        let summary = player(m).play(1, &target).await.unwrap();
        assert_eq!(summary.passes_completed, 1);
        assert_eq!(summary.events_emitted, 3);

        let log = inj.log();
        let nominal = [0u64, 50, 120];
        assert_eq!(log.len(), 3);
        for ((at, _), want) in log.iter().zip(nominal) {
            let got = at.as_millis() as i64;
            assert!((got - want as i64).abs() <= 2, "event at {got} ms, wanted {want} ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_are_back_to_back_and_honor_trailing_delay() {
        let m = MacroBuilder::new("loop")
            .wheel(1)
            .trailing_delay(100)
            .build();
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());

        let summary = player(m).play(3, &target).await.unwrap();
        assert_eq!(summary.passes_completed, 3);
        let times: Vec<u128> = inj.log().iter().map(|(t, _)| t.as_millis()).collect();
        assert_eq!(times, vec![0, 100, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_multiplier_compresses_time() {
        let m = MacroBuilder::new("fast").wheel(1).wait(100).wheel(-1).build();
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());
        let p = MacroPlayer::new(Arc::new(m), PlayerConfig { speed: 2.0 });

        p.play(1, &target).await.unwrap();
        let times: Vec<u128> = inj.log().iter().map(|(t, _)| t.as_millis()).collect();
        assert_eq!(times, vec![0, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_held_button_once() {
        let m = MacroBuilder::new("hold")
            .press(MouseButton::Left)
            .wait(1000)
            .release(MouseButton::Left)
            .build();
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());
        let p = player(m);

        let task = {
            let p = p.clone();
            tokio::spawn(async move { p.play(1, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(p.is_playing());
        p.cancel();

        let summary = task.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.released_buttons, vec![MouseButton::Left]);
        assert_eq!(inj.count(&Injected::Up(MouseButton::Left)), 1);
        assert!(!p.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_release_is_retried_on_exit() {
        let m = MacroBuilder::new("sticky")
            .press(MouseButton::Left)
            .wait(10)
            .release(MouseButton::Left)
            .build();
        let inj = RecordingInjector::failing_ups(1);
        let target = PlaybackTarget::Host(inj.clone());

        let result = player(m).play(1, &target).await;
        assert!(matches!(result, Err(Error::Hid(_))));
        // The failed release plus the one issued on exit.
        assert_eq!(inj.count(&Injected::Up(MouseButton::Left)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn released_buttons_lists_only_successful_releases() {
        let m = MacroBuilder::new("stuck")
            .press(MouseButton::Right)
            .wait(1000)
            .build();
        let inj = RecordingInjector::failing_ups(1);
        let target = PlaybackTarget::Host(inj.clone());
        let p = player(m);

        let task = {
            let p = p.clone();
            tokio::spawn(async move { p.play(1, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        p.cancel();

        let summary = task.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert!(summary.released_buttons.is_empty());
        assert_eq!(inj.count(&Injected::Up(MouseButton::Right)), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_right_after_start_is_not_lost() {
        let m = Arc::new(MacroBuilder::new("long").wheel(1).wait(60_000).wheel(1).build());
        for _ in 0..50 {
            let inj = RecordingInjector::new(vec![]);
            let target = PlaybackTarget::Host(inj);
            let p = Arc::new(MacroPlayer::new(m.clone(), PlayerConfig::default()));
            let task = {
                let p = p.clone();
                tokio::spawn(async move { p.play(1, &target).await })
            };
            while !p.is_playing() {
                tokio::task::yield_now().await;
            }
            p.cancel();
            let summary = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("cancel was lost")
                .unwrap()
                .unwrap();
            assert!(summary.cancelled);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_repeat_stops_on_cancel() {
        let m = MacroBuilder::new("spin").move_by(1, 1).trailing_delay(10).build();
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());
        let p = player(m);

        let task = {
            let p = p.clone();
            tokio::spawn(async move { p.play(0, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(95)).await;
        p.cancel();

        let summary = task.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert!(summary.passes_completed >= 5);
        assert!(summary.released_buttons.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_play_is_rejected() {
        let m = MacroBuilder::new("busy").wheel(1).wait(500).wheel(1).build();
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());
        let p = player(m);

        let task = {
            let (p, target) = (p.clone(), target.clone());
            tokio::spawn(async move { p.play(1, &target).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(p.play(1, &target).await, Err(Error::AlreadyPlaying(_))));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn empty_macro_finishes_immediately() {
        let inj = RecordingInjector::new(vec![]);
        let target = PlaybackTarget::Host(inj.clone());
        let summary = player(Macro::from_events("none", vec![]))
            .play(0, &target)
            .await
            .unwrap();
        assert_eq!(summary, PlaybackSummary::default());
    }
}

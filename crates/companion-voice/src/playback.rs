//! Playback scheduling: plays a response clip and drives the mouth shape in lockstep.
//!
//! A fixed-tick `FrameTicker` stands in for the display refresh. Each tick reads the
//! viseme sample for the current playback position; an empty track falls back to a
//! generic speaking cycle. The ticker lives only as long as the clip plays.

use crate::amplitude::{VisemeTrack, FRAME_INTERVAL};
use crate::error::PlaybackError;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink};
use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Speaker output. `play` resolves once the clip has finished (or was stopped).
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Vec<u8>) -> Result<(), PlaybackError>;

    fn stop(&self);
}

/// Fixed-rate animation clock.
pub struct FrameTicker {
    interval: Interval,
}

impl FrameTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Mouth opening for a playback position, read from the track.
/// Frame indices wrap so a frame landing after the last window is still valid.
pub fn track_shape(track: &VisemeTrack, elapsed: Duration) -> Option<f32> {
    let frame_index = (elapsed.as_millis() / FRAME_INTERVAL.as_millis()) as usize;
    track.at(frame_index)
}

/// Generic talking cycle (4 Hz, 0.25..0.6) used when no track is available.
pub fn speaking_shape(elapsed: Duration) -> f32 {
    let phase = elapsed.as_secs_f32() * 4.0 * 2.0 * PI;
    0.25 + 0.35 * (0.5 - 0.5 * phase.cos())
}

#[derive(Clone)]
pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    frame_tick: Duration,
    mouth: Arc<watch::Sender<f32>>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn AudioSink>, frame_tick: Duration) -> Self {
        let (mouth, _) = watch::channel(0.0);
        Self {
            sink,
            frame_tick,
            mouth: Arc::new(mouth),
        }
    }

    /// Current mouth opening, `0.0..=1.0`; 0 while silent.
    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.mouth.subscribe()
    }

    /// Play `audio`, animating from `track` until the sink reports completion.
    pub async fn play(&self, audio: Vec<u8>, track: VisemeTrack) -> Result<(), PlaybackError> {
        let lip_sync = !track.is_empty();
        info!(bytes = audio.len(), frames = track.len(), lip_sync, "🔊 Playing response");
        let started = Instant::now();
        let playback = self.sink.play(audio);
        tokio::pin!(playback);
        let mut ticker = FrameTicker::new(self.frame_tick);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut playback => break result,
                now = ticker.tick() => {
                    let elapsed = now.saturating_duration_since(started);
                    let shape = track_shape(&track, elapsed).unwrap_or_else(|| speaking_shape(elapsed));
                    self.mouth.send_replace(shape);
                }
            }
        };

        self.mouth.send_replace(0.0);
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Playback finished");
        result
    }

    /// Silence the speaker and close the mouth. The owner aborts the `play` task.
    pub fn stop(&self) {
        self.sink.stop();
        self.mouth.send_replace(0.0);
    }
}

/// The clip currently on the speaker, guarded by a generation counter.
///
/// Every `begin` and `cancel` bumps the generation. A clip thread may only put its
/// sink on the speaker while its own generation is current, so a `stop` that lands
/// before the device is ready still wins.
struct ClipSlot<S> {
    inner: Mutex<SlotState<S>>,
}

struct SlotState<S> {
    generation: u64,
    active: Option<S>,
}

impl<S> Default for ClipSlot<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                generation: 0,
                active: None,
            }),
        }
    }
}

impl<S> ClipSlot<S> {
    fn lock(&self) -> MutexGuard<'_, SlotState<S>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a generation for a new clip.
    fn begin(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.generation
    }

    /// Install `sink` and run `start` on it, both under the lock. Refused when the
    /// clip was cancelled or superseded since `begin`.
    fn install(&self, generation: u64, sink: S, start: impl FnOnce(&S)) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        start(&sink);
        state.active = Some(sink);
        true
    }

    /// Clear the slot if it still holds this clip.
    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.active = None;
        }
    }

    /// Invalidate every clip started so far and hand back the one playing.
    fn cancel(&self) -> Option<S> {
        let mut state = self.lock();
        state.generation += 1;
        state.active.take()
    }
}

/// Speaker sink on the default output device via rodio.
///
/// Each clip plays on its own thread because `OutputStream` is not `Send`.
#[derive(Default)]
pub struct RodioSink {
    current: Arc<ClipSlot<Arc<Sink>>>,
}

impl RodioSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, audio: Vec<u8>) -> Result<(), PlaybackError> {
        if audio.is_empty() {
            return Ok(());
        }
        let generation = self.current.begin();
        let (done_tx, done_rx) = oneshot::channel();
        let current = Arc::clone(&self.current);
        std::thread::spawn(move || {
            let result = play_blocking(audio, &current, generation);
            let _ = done_tx.send(result);
        });
        done_rx
            .await
            .map_err(|_| PlaybackError::Playback("playback thread exited".to_string()))?
    }

    fn stop(&self) {
        if let Some(sink) = self.current.cancel() {
            sink.stop();
            info!("Speaker stopped");
        }
    }
}

fn play_blocking(
    audio: Vec<u8>,
    current: &ClipSlot<Arc<Sink>>,
    generation: u64,
) -> Result<(), PlaybackError> {
    let (_stream, handle) = OutputStream::try_default()?;
    let sink = Arc::new(Sink::try_new(&handle)?);
    let source = Decoder::new(Cursor::new(audio))
        .map_err(|e| PlaybackError::Playback(format!("Decode failed: {}", e)))?;
    if !current.install(generation, Arc::clone(&sink), |sink| sink.append(source)) {
        debug!(generation, "Clip cancelled before it reached the speaker");
        return Ok(());
    }
    sink.sleep_until_end();
    current.release(generation);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TimedSink {
        length: Duration,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for TimedSink {
        async fn play(&self, _audio: Vec<u8>) -> Result<(), PlaybackError> {
            tokio::time::sleep(self.length).await;
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler(length: Duration) -> (PlaybackScheduler, Arc<TimedSink>) {
        let sink = Arc::new(TimedSink {
            length,
            stops: AtomicUsize::new(0),
        });
        (
            PlaybackScheduler::new(sink.clone(), Duration::from_millis(16)),
            sink,
        )
    }

    #[test]
    fn track_index_follows_playback_clock() {
        let track = VisemeTrack::from_samples(vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(track_shape(&track, Duration::from_millis(0)), Some(0.1));
        assert_eq!(track_shape(&track, Duration::from_millis(49)), Some(0.1));
        assert_eq!(track_shape(&track, Duration::from_millis(50)), Some(0.2));
        assert_eq!(track_shape(&track, Duration::from_millis(199)), Some(0.4));
        // Late frame past the end wraps instead of overrunning.
        assert_eq!(track_shape(&track, Duration::from_millis(210)), Some(0.1));
        assert_eq!(track_shape(&VisemeTrack::default(), Duration::ZERO), None);
    }

    #[test]
    fn speaking_shape_is_periodic_and_bounded() {
        for ms in (0..1_000).step_by(7) {
            let v = speaking_shape(Duration::from_millis(ms));
            assert!((0.25..=0.6 + 1e-6).contains(&v));
        }
        let a = speaking_shape(Duration::from_millis(30));
        let b = speaking_shape(Duration::from_millis(280));
        assert!((a - b).abs() < 1e-4);
    }

    #[tokio::test(start_paused = true)]
    async fn play_drives_mouth_then_closes_it() {
        let (scheduler, _sink) = scheduler(Duration::from_secs(1));
        let mut mouth = scheduler.subscribe();
        let track = VisemeTrack::from_samples(vec![0.8; 20]);

        let play = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.play(vec![1, 2, 3], track).await }
        });

        mouth.changed().await.unwrap();
        assert!((*mouth.borrow_and_update() - 0.8).abs() < 1e-6);

        play.await.unwrap().unwrap();
        assert_eq!(*mouth.borrow_and_update(), 0.0);

        // No ticker survives completion.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!mouth.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_track_uses_generic_animation() {
        let (scheduler, _sink) = scheduler(Duration::from_millis(500));
        let mut mouth = scheduler.subscribe();
        let play = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.play(vec![1], VisemeTrack::default()).await }
        });

        let mut peak = 0.0f32;
        while !play.is_finished() {
            if mouth.changed().await.is_err() {
                break;
            }
            peak = peak.max(*mouth.borrow_and_update());
        }
        assert!(peak >= 0.25);
        play.await.unwrap().unwrap();
    }

    #[test]
    fn stop_before_install_keeps_clip_off_speaker() {
        let slot = ClipSlot::default();
        let clip = slot.begin();
        assert!(slot.cancel().is_none());

        let mut started = false;
        assert!(!slot.install(clip, "late clip", |_| started = true));
        assert!(!started);
        assert!(slot.cancel().is_none());
    }

    #[test]
    fn finished_clip_leaves_newer_one_stoppable() {
        let slot = ClipSlot::default();
        let first = slot.begin();
        assert!(slot.install(first, "first", |_| {}));

        // Interrupted by a new reply: stop, then play again.
        assert_eq!(slot.cancel(), Some("first"));
        let second = slot.begin();
        assert!(slot.install(second, "second", |_| {}));

        slot.release(first);
        assert_eq!(slot.cancel(), Some("second"));
    }

    #[tokio::test]
    async fn stop_closes_mouth_and_silences_sink() {
        let (scheduler, sink) = scheduler(Duration::from_millis(10));
        scheduler.mouth.send_replace(0.7);
        scheduler.stop();
        assert_eq!(*scheduler.subscribe().borrow(), 0.0);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }
}

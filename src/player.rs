//! Replays recorded frames into a bus as if they arrived from a transport.
//!
//! Every released frame is decoded and fed through [`Bus::process_packet`], the same
//! entry point live traffic uses, so downstream consumers cannot tell replay from a
//! real link.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bus::Bus;
use crate::packet::decode_frames;
use crate::trace::{Frame, Trace};

/// Wall-clock period between replay steps.
pub const PLAYER_TICK: Duration = Duration::from_millis(50);
/// Minimum bus time between two unforced progress notifications.
pub const PROGRESS_INTERVAL_MS: f64 = 250.0;

// Frame offsets and elapsed time are both derived from float milliseconds.
const OFFSET_TOLERANCE_MS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Started,
    Stopped,
    /// A frame was released into the bus.
    Frame(Frame),
    /// Replay progress in `0.0..=1.0`.
    Progress(f64),
}

#[derive(Debug, Default)]
struct PlayState {
    start: f64,
    index: usize,
    last_progress: f64,
    cancel: Option<CancellationToken>,
}

struct PlayerInner {
    bus: Bus,
    frames: Vec<Frame>,
    speed: Mutex<f64>,
    state: Mutex<PlayState>,
    events: broadcast::Sender<PlayerEvent>,
}

/// Deterministic frame replay.
#[derive(Clone)]
pub struct FramePlayer {
    inner: Arc<PlayerInner>,
}

impl FramePlayer {
    pub fn new(bus: &Bus, frames: Vec<Frame>, speed: f64) -> Self {
        let frames = Trace::new(frames).into_frames();
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(PlayerInner {
                bus: bus.clone(),
                frames,
                speed: Mutex::new(speed),
                state: Mutex::new(PlayState::default()),
                events,
            }),
        }
    }

    pub fn from_trace(bus: &Bus, trace: Trace, speed: f64) -> Self {
        Self::new(bus, trace.into_frames(), speed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.inner.frames
    }

    pub fn speed(&self) -> f64 {
        *self.inner.speed.lock()
    }

    pub fn set_speed(&self, speed: f64) {
        *self.inner.speed.lock() = speed;
    }

    pub fn running(&self) -> bool {
        self.inner.state.lock().cancel.is_some()
    }

    /// Frames released in the current or last run.
    pub fn frame_index(&self) -> usize {
        self.inner.state.lock().index
    }

    /// Trace time covered since `start`, scaled by speed.
    pub fn elapsed(&self) -> f64 {
        self.inner.elapsed()
    }

    pub fn duration(&self) -> f64 {
        self.inner.duration()
    }

    pub fn progress(&self) -> f64 {
        self.inner.progress()
    }

    /// Start replaying from the first frame. No-op while running.
    pub fn start(&self) {
        let cancel = {
            let mut state = self.inner.state.lock();
            if state.cancel.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            state.start = self.inner.bus.timestamp();
            state.index = 0;
            state.cancel = Some(cancel.clone());
            cancel
        };
        debug!(frames = self.inner.frames.len(), speed = self.speed(), "replay started");
        self.inner.emit(PlayerEvent::Started);
        self.inner.emit_progress(true);
        spawn_ticker(Arc::downgrade(&self.inner), cancel);
    }

    /// Stop replaying. Stopping a stopped player does nothing.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for FramePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePlayer")
            .field("frames", &self.inner.frames.len())
            .field("running", &self.running())
            .finish()
    }
}

impl PlayerInner {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn elapsed(&self) -> f64 {
        let start = self.state.lock().start;
        (self.bus.timestamp() - start) * *self.speed.lock()
    }

    fn duration(&self) -> f64 {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    fn progress(&self) -> f64 {
        let duration = self.duration();
        if duration <= 0.0 {
            let released = self.state.lock().index;
            return if self.frames.is_empty() || released >= self.frames.len() { 1.0 } else { 0.0 };
        }
        (self.elapsed() / duration).clamp(0.0, 1.0)
    }

    fn emit_progress(&self, force: bool) {
        let now = self.bus.timestamp();
        {
            let mut state = self.state.lock();
            if !force && now - state.last_progress <= PROGRESS_INTERVAL_MS {
                return;
            }
            state.last_progress = now;
        }
        self.emit(PlayerEvent::Progress(self.progress()));
    }

    /// Release every frame due by now. Returns `true` once all frames are out.
    fn tick(&self) -> bool {
        let elapsed = self.elapsed();
        let Some(first) = self.frames.first().map(|f| f.timestamp) else { return true };
        let (start, mut index) = {
            let state = self.state.lock();
            (state.start, state.index)
        };

        let mut packets = 0;
        while let Some(frame) = self.frames.get(index) {
            let offset = frame.timestamp - first;
            if offset > elapsed + OFFSET_TOLERANCE_MS {
                break;
            }
            self.emit(PlayerEvent::Frame(frame.clone()));
            let decoded = decode_frames(&frame.data, start + offset);
            packets += decoded.packets.len();
            for pkt in decoded.packets {
                self.bus.process_packet(pkt);
            }
            index += 1;
        }
        self.state.lock().index = index;
        trace!(index, packets, "replay tick");

        self.emit_progress(false);
        index >= self.frames.len()
    }

    fn stop(&self) {
        let Some(cancel) = self.state.lock().cancel.take() else { return };
        cancel.cancel();
        self.emit_progress(true);
        self.emit(PlayerEvent::Stopped);
        debug!("replay stopped");
    }
}

fn spawn_ticker(weak: Weak<PlayerInner>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLAYER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            if inner.tick() {
                inner.stop();
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusEvent, BusOptions};
    use crate::packet::{DeviceId, Packet};
    use tokio::sync::broadcast::error::TryRecvError;

    fn trace_frames(stamps: &[f64]) -> Vec<Frame> {
        stamps
            .iter()
            .enumerate()
            .map(|(i, &ts)| {
                let id = DeviceId::new([i as u8 + 1; 8]);
                Frame::new(ts, Packet::announce(id, 1, &[]).unwrap().to_frame())
            })
            .collect()
    }

    /// Bus time at which each replayed packet reached the bus.
    async fn dispatch_times(speed: f64) -> Vec<f64> {
        let bus = Bus::new(BusOptions::default()).unwrap();
        let self_id = bus.self_device_id();
        let player = FramePlayer::new(&bus, trace_frames(&[0.0, 100.0, 300.0]), speed);
        let mut events = bus.subscribe();
        let started = bus.timestamp();
        player.start();

        let mut times = Vec::new();
        while times.len() < 3 {
            match events.recv().await.unwrap() {
                BusEvent::PacketReceive(pkt) if pkt.device_id() != self_id => {
                    times.push(bus.timestamp() - started);
                }
                _ => {}
            }
        }
        times
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1.0, "dispatched at {actual:?}, expected {expected:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_at_recorded_pace() {
        assert_close(&dispatch_times(1.0).await, &[0.0, 100.0, 300.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn double_speed_halves_offsets() {
        assert_close(&dispatch_times(2.0).await, &[0.0, 50.0, 150.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_end_with_forced_progress() {
        let bus = Bus::new(BusOptions::default()).unwrap();
        let player = FramePlayer::new(&bus, trace_frames(&[0.0, 100.0]), 1.0);
        let mut events = player.subscribe();
        player.start();
        player.start();
        assert!(player.running());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!player.running());
        assert_eq!(player.frame_index(), 2);
        player.stop();

        let mut seen = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => seen.push(event),
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        assert_eq!(seen.first(), Some(&PlayerEvent::Started));
        assert_eq!(seen.last(), Some(&PlayerEvent::Stopped));
        assert_eq!(seen.iter().filter(|e| matches!(e, PlayerEvent::Started)).count(), 1);
        assert_eq!(seen.iter().filter(|e| matches!(e, PlayerEvent::Frame(_))).count(), 2);
        assert!(matches!(seen[seen.len() - 2], PlayerEvent::Progress(p) if p > 0.999));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_player_finishes_immediately() {
        let bus = Bus::new(BusOptions::default()).unwrap();
        let player = FramePlayer::new(&bus, Vec::new(), 1.0);
        player.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!player.running());
        assert_eq!(player.progress(), 1.0);
        assert_eq!(player.duration(), 0.0);
    }
}

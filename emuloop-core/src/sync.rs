//! # Frame Sync - Producer/Consumer Handoff
//!
//! Bounded handoff between the execution thread (producer of completed
//! frames and audio) and a consumer thread (renderer/audio output).
//!
//! ```text
//! ┌───────────┐  wait_for_frame   ┌───────────┐  frame_available   ┌──────────┐
//! │ Execution │──────────────────►│ FrameSync │───────────────────►│ Consumer │
//! │ Thread    │◄──────────────────│  (slots)  │◄───────────────────│ Thread   │
//! └───────────┘   slot released   └───────────┘   consumer_ready   └──────────┘
//! ```
//!
//! - Video sync: the producer waits for a free slot and is capped at the
//!   target frame rate.
//! - No video sync or drop-frames: the producer never waits on the
//!   consumer; frames that find no free slot are dropped.
//! - Any setting change, or [`FrameSync::wake`], wakes every waiter so it
//!   re-evaluates its condition.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::config::SyncConfig;

// ============================================================================
// Frames
// ============================================================================

/// A completed frame handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Completed-frame count at the boundary that produced it
    pub number: u64,
    pub pixels: Bytes,
}

/// What happened to a frame offered by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDelivery {
    /// Queued for the consumer
    Delivered,
    /// No free slot and dropping was permitted
    Dropped,
    /// Video output is gated off, or the wait was cancelled
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub produced: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub consumed: u64,
    pub audio_samples: u64,
    pub audio_discarded: u64,
}

// ============================================================================
// Pacing
// ============================================================================

/// Deadline scheduler for the target frame rate
#[derive(Debug)]
struct Pacer {
    target: Duration,
    next: Option<Instant>,
}

impl Pacer {
    fn new(fps: f64) -> Self {
        let mut pacer = Self {
            target: Duration::from_millis(16),
            next: None,
        };
        pacer.set_fps(fps);
        pacer
    }

    fn set_fps(&mut self, fps: f64) {
        if fps > 0.0 && fps.is_finite() {
            self.target = Duration::from_secs_f64(1.0 / fps);
        }
    }

    /// Deadline for the next frame. Falling more than a frame behind
    /// resets the schedule instead of bursting to catch up.
    fn schedule(&mut self, now: Instant) -> Instant {
        let deadline = match self.next {
            Some(previous) => previous + self.target,
            None => now,
        };
        let deadline = if deadline + self.target < now { now } else { deadline };
        self.next = Some(deadline);
        deadline
    }

    fn reset(&mut self) {
        self.next = None;
    }
}

// ============================================================================
// Frame Sync
// ============================================================================

struct SyncState {
    queue: VecDeque<VideoFrame>,
    /// Frames handed to the consumer and not yet released
    in_flight: usize,
    slots: usize,
    video_sync: bool,
    drop_frames: bool,
    frame_on: bool,
    pacer: Pacer,
    audio: VecDeque<i16>,
    audio_sync: bool,
    audio_capacity: usize,
    stats: SyncStats,
}

impl SyncState {
    fn slot_free(&self) -> bool {
        self.queue.len() + self.in_flight < self.slots
    }

    fn may_drop(&self) -> bool {
        !self.video_sync || self.drop_frames
    }
}

pub struct FrameSync {
    state: Mutex<SyncState>,
    /// Producer side: slot released, audio consumed, settings changed
    producer: Condvar,
    /// Consumer side: frame queued, settings changed
    consumer: Condvar,
}

impl FrameSync {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: Mutex::new(SyncState {
                queue: VecDeque::with_capacity(config.frame_slots.max(1)),
                in_flight: 0,
                slots: config.frame_slots.max(1),
                video_sync: config.video_sync,
                drop_frames: config.drop_frames,
                frame_on: true,
                pacer: Pacer::new(config.target_fps),
                audio: VecDeque::with_capacity(config.audio_buffer_samples),
                audio_sync: config.audio_sync,
                audio_capacity: config.audio_buffer_samples.max(1),
                stats: SyncStats::default(),
            }),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        }
    }

    // ========================================================================
    // Producer API (Execution Thread)
    // ========================================================================

    /// Offer a completed frame.
    ///
    /// Blocks while every slot is held and dropping is not permitted, then
    /// throttles to the target rate when video sync is on. `cancel` is
    /// re-checked on every wakeup; once it returns true the frame is
    /// skipped and the call returns without waiting further.
    pub fn wait_for_frame(&self, frame: VideoFrame, cancel: &dyn Fn() -> bool) -> FrameDelivery {
        let mut state = self.state.lock();
        state.stats.produced += 1;

        if !state.frame_on {
            state.stats.skipped += 1;
            return FrameDelivery::Skipped;
        }

        loop {
            if cancel() {
                state.stats.skipped += 1;
                return FrameDelivery::Skipped;
            }
            if state.slot_free() {
                break;
            }
            if state.may_drop() {
                state.stats.dropped += 1;
                return FrameDelivery::Dropped;
            }
            self.producer.wait(&mut state);
        }

        state.queue.push_back(frame);
        state.stats.delivered += 1;
        self.consumer.notify_all();

        if state.video_sync && !state.drop_frames {
            let deadline = state.pacer.schedule(Instant::now());
            loop {
                if cancel() || !state.video_sync || state.drop_frames {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.producer.wait_for(&mut state, remaining);
            }
        }
        FrameDelivery::Delivered
    }

    /// Hand over audio produced during the last frame.
    ///
    /// With audio sync on, blocks while the buffer cannot take the samples
    /// (unless `cancel` fires). Otherwise the oldest samples are discarded
    /// to make room.
    pub fn produce_audio(&self, samples: &[i16], cancel: &dyn Fn() -> bool) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        while state.audio_sync
            && !state.audio.is_empty()
            && state.audio.len() + samples.len() > state.audio_capacity
            && !cancel()
        {
            self.producer.wait(&mut state);
        }

        state.audio.extend(samples.iter().copied());
        state.stats.audio_samples += samples.len() as u64;
        let overflow = state.audio.len().saturating_sub(state.audio_capacity);
        if overflow > 0 && !state.audio_sync {
            state.audio.drain(..overflow);
            state.stats.audio_discarded += overflow as u64;
        }
        self.consumer.notify_all();
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Take the oldest delivered frame, waiting up to `timeout` for one.
    ///
    /// Returns `None` at once when video output is gated off. The frame
    /// keeps its slot until [`FrameSync::consumer_ready`].
    pub fn frame_available(&self, timeout: Duration) -> Option<VideoFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.queue.is_empty() && state.frame_on {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.consumer.wait_for(&mut state, remaining);
        }
        let frame = state.queue.pop_front()?;
        state.in_flight += 1;
        state.stats.consumed += 1;
        Some(frame)
    }

    /// Release the slot of the frame last taken
    pub fn consumer_ready(&self) {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            tracing::warn!("consumer_ready called with no frame held");
            return;
        }
        state.in_flight -= 1;
        self.producer.notify_all();
    }

    /// Take up to `max` buffered audio samples
    pub fn consume_audio(&self, max: usize) -> Vec<i16> {
        let mut state = self.state.lock();
        let count = max.min(state.audio.len());
        let samples: Vec<i16> = state.audio.drain(..count).collect();
        if count > 0 {
            self.producer.notify_all();
        }
        samples
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn set_video_sync(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.video_sync = enabled;
        state.pacer.reset();
        self.wake_locked();
    }

    pub fn video_sync(&self) -> bool {
        self.state.lock().video_sync
    }

    pub fn set_drop_frames(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.drop_frames = enabled;
        state.pacer.reset();
        self.wake_locked();
    }

    pub fn drop_frames(&self) -> bool {
        self.state.lock().drop_frames
    }

    pub fn set_audio_sync(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.audio_sync = enabled;
        self.wake_locked();
    }

    pub fn set_target_fps(&self, fps: f64) {
        let mut state = self.state.lock();
        state.pacer.set_fps(fps);
        state.pacer.reset();
    }

    /// Gate video output. While off, offered frames are skipped and
    /// consumers never wait.
    pub fn set_frame_on(&self, on: bool) {
        let mut state = self.state.lock();
        state.frame_on = on;
        state.pacer.reset();
        self.wake_locked();
    }

    pub fn frame_on(&self) -> bool {
        self.state.lock().frame_on
    }

    /// Wake every waiter so it re-checks its condition
    pub fn wake(&self) {
        let _state = self.state.lock();
        self.wake_locked();
    }

    fn wake_locked(&self) {
        self.producer.notify_all();
        self.consumer.notify_all();
    }

    /// Drop queued frames and audio and forget held slots
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.in_flight = 0;
        state.audio.clear();
        state.pacer.reset();
        self.wake_locked();
    }

    pub fn stats(&self) -> SyncStats {
        self.state.lock().stats.clone()
    }
}

impl Default for FrameSync {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

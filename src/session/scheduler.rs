//! Gapless playback scheduling with barge-in support
//!
//! Agent audio arrives as discrete network messages at unpredictable times.
//! The scheduler keeps a clock cursor holding the earliest time the next buffer
//! may start, so buffers play back to back regardless of when they arrived.

use crate::audio::resample;
use crate::models::AudioBuffer;
use log::{debug, trace};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one scheduled buffer on the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Output device driven by the scheduler
///
/// Natural completion of a buffer is reported back to the session loop as a
/// `PlaybackEnded` event.
pub trait AudioOutput {
    /// Rate buffers must have when handed to `start`
    fn sample_rate(&self) -> u32;

    /// Position of the output clock in seconds
    fn current_time(&self) -> f64;

    /// Play a mono buffer beginning at clock position `at`
    fn start(&mut self, handle: HandleId, at: f64, buffer: &AudioBuffer);

    /// Silence a buffer immediately, whether or not it has begun playing
    fn stop(&mut self, handle: HandleId);
}

/// One buffer scheduled on the output clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: HandleId,
    pub start_time: f64,
    pub duration: f64,
}

impl PlaybackHandle {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler<O> {
    output: O,
    /// Earliest start time for the next buffer
    cursor: f64,
    active: BTreeMap<HandleId, PlaybackHandle>,
    next_id: u64,
    scheduled_total: u64,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            scheduled_total: 0,
        }
    }

    /// Schedule `buffer` right after everything already queued
    pub fn enqueue(&mut self, buffer: AudioBuffer) -> PlaybackHandle {
        let buffer = self.conform(buffer);

        let now = self.output.current_time();
        let start_time = self.cursor.max(now);
        self.next_id += 1;
        let handle = PlaybackHandle {
            id: HandleId(self.next_id),
            start_time,
            duration: buffer.duration(),
        };

        self.output.start(handle.id, start_time, &buffer);
        self.cursor = handle.end_time();
        self.active.insert(handle.id, handle);
        self.scheduled_total += 1;

        trace!(
            "Scheduled {} at {:.3}s for {:.3}s (clock {:.3}s)",
            handle.id,
            handle.start_time,
            handle.duration,
            now
        );
        handle
    }

    /// Stop everything queued or playing and pull the cursor back to now
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.output.stop(*id);
        }
        self.active.clear();
        self.cursor = self.output.current_time();

        debug!(
            "Playback interrupted: {} buffer(s) stopped, cursor reset to {:.3}s",
            stopped, self.cursor
        );
        stopped
    }

    /// A buffer finished on its own; no-op if it was already interrupted
    pub fn on_ended(&mut self, id: HandleId) -> bool {
        self.active.remove(&id).is_some()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_handles(&self) -> impl Iterator<Item = &PlaybackHandle> {
        self.active.values()
    }

    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total
    }

    /// Mono at the output rate
    fn conform(&self, buffer: AudioBuffer) -> AudioBuffer {
        let buffer = buffer.into_mono();
        let target_rate = self.output.sample_rate();
        if buffer.sample_rate == target_rate || target_rate == 0 {
            return buffer;
        }
        AudioBuffer {
            data: resample(&buffer.data, buffer.sample_rate, target_rate),
            sample_rate: target_rate,
            channels: 1,
        }
    }
}

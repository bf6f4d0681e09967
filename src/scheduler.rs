//! Time-ordered queue of encoded frames held back by a delay injection.

use crate::slip::EncodedFrame;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_DELAYED_FRAMES: usize = 8;
const MAX_RELEASED_PER_POLL: usize = 4;

#[derive(Debug, Clone)]
pub struct DelayedFrame {
    pub frame: EncodedFrame,
    pub release_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DelayLineStats {
    pub total_delayed: u32,
    pub total_released: u32,
    pub total_discarded: u32,
    pub currently_held: u8,
}

#[derive(Debug, Default)]
pub struct DelayLine {
    frames: Vec<DelayedFrame, MAX_DELAYED_FRAMES>,
    stats: DelayLineStats,
}

impl DelayLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `frame` until `now_ms + delay_ms`. A full line discards the frame.
    pub fn schedule(&mut self, frame: EncodedFrame, now_ms: u64, delay_ms: u32) -> bool {
        let release_at_ms = now_ms + u64::from(delay_ms);
        let entry = DelayedFrame {
            frame,
            release_at_ms,
        };

        if self.frames.push(entry).is_err() {
            self.stats.total_discarded += 1;
            warn!("delay line full, frame discarded");
            return false;
        }
        // Stable sort keeps equal release times in transmit order.
        self.frames.sort_by_key(|f| f.release_at_ms);

        self.stats.total_delayed += 1;
        self.stats.currently_held = self.frames.len() as u8;
        true
    }

    /// Frames whose release time has arrived, oldest first.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<EncodedFrame, MAX_RELEASED_PER_POLL> {
        let mut due = Vec::new();
        while let Some(first) = self.frames.first() {
            if first.release_at_ms > now_ms || due.is_full() {
                // Sorted by release time; anything left waits for a later poll.
                break;
            }
            let entry = self.frames.remove(0);
            let _ = due.push(entry.frame);
            self.stats.total_released += 1;
        }
        self.stats.currently_held = self.frames.len() as u8;
        due
    }

    /// Everything still held, in release order, regardless of due time.
    pub fn drain(&mut self) -> Vec<EncodedFrame, MAX_DELAYED_FRAMES> {
        let mut all = Vec::new();
        for entry in self.frames.iter() {
            let _ = all.push(entry.frame.clone());
        }
        self.stats.total_released += self.frames.len() as u32;
        self.frames.clear();
        self.stats.currently_held = 0;
        all
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn stats(&self) -> &DelayLineStats {
        &self.stats
    }
}

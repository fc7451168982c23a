//! # Playback Scheduling
//!
//! Schedules decoded AI audio for gapless, strictly sequential playback.
//!
//! ## Virtual clock:
//! `next_start_time` is the earliest output-clock time at which the next buffer may
//! start. Every scheduled buffer starts at `max(next_start_time, output.now())` and
//! pushes the clock forward by its own duration, so buffers arriving faster than
//! real time queue up back to back, and a buffer arriving after the queue drained
//! starts right away instead of "catching up" on lost time.
//!
//! ## Interruption (barge-in):
//! `flush()` stops every active unit and resets the clock to zero, so the next
//! buffer starts at the output's current time rather than after the stopped ones.
//!
//! The scheduler is owned by exactly one controller and mutated only from the
//! bridge task, so none of this needs a lock.

use crate::audio::codec::PcmBuffer;
use crate::audio::output::AudioOutput;
use crate::error::BridgeError;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A buffer placed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

pub struct PlaybackScheduler {
    next_start_time: f64,
    active: BTreeMap<u64, PlaybackUnit>,
    next_unit_id: u64,
    output: Option<Box<dyn AudioOutput>>,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_unit_id: 1,
            output: None,
        }
    }

    /// Attach a freshly opened output. Any previous output is flushed and closed first.
    pub fn attach(&mut self, output: Box<dyn AudioOutput>) {
        if self.output.is_some() {
            self.detach();
        }
        self.output = Some(output);
        self.next_start_time = 0.0;
    }

    /// Flush and close the current output, if any.
    pub fn detach(&mut self) {
        self.flush();
        if let Some(mut output) = self.output.take() {
            output.close();
            info!("Playback output closed");
        }
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Fails with `OutputUnavailable` when no output is attached or the output
    /// rejects the buffer; the buffer is then dropped and the clock is left alone.
    pub fn schedule(&mut self, buffer: PcmBuffer) -> Result<PlaybackUnit, BridgeError> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| BridgeError::OutputUnavailable("no playback output attached".to_string()))?;

        let start_at = self.next_start_time.max(output.now());
        let duration = buffer.duration();
        let unit = PlaybackUnit {
            id: self.next_unit_id,
            start_at,
            duration,
        };

        output.start(unit.id, buffer, start_at)?;

        self.next_unit_id += 1;
        self.active.insert(unit.id, unit);
        self.next_start_time = unit.end_at();

        debug!(
            unit_id = unit.id,
            start_at = unit.start_at,
            duration = unit.duration,
            queued = self.active.len(),
            "Scheduled playback unit"
        );
        Ok(unit)
    }

    /// Stop every active unit, clear the set and reset the clock. Returns how
    /// many units were stopped.
    pub fn flush(&mut self) -> usize {
        let stopped = self.active.len();
        if let Some(output) = self.output.as_mut() {
            for id in self.active.keys() {
                output.stop(*id);
            }
        } else if stopped > 0 {
            warn!(stopped, "Flushing playback units without an output");
        }
        self.active.clear();
        self.next_start_time = 0.0;

        if stopped > 0 {
            debug!(stopped, "Flushed playback queue");
        }
        stopped
    }

    /// A unit played out on its own. Returns false for ids that were already
    /// flushed (their completion can race the flush).
    pub fn on_ended(&mut self, unit_id: u64) -> bool {
        self.active.remove(&unit_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

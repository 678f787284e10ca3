//! Decode & playback scheduling.
//!
//! Every decoded payload becomes one unit on the playback timeline, placed at
//! `max(cursor, now)` so units never overlap and always play in arrival
//! order. An interruption stops whatever is playing and rewinds the cursor so
//! the next unit starts at device time.

use crate::error::VoiceResult;
use crate::pcm;
use crate::playback::{PlaybackTimeline, UnitId};
use crate::protocol::ServerMessage;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do when the schedule runs far ahead of the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LagPolicy {
    /// Keep every unit; latency grows without bound.
    #[default]
    Unbounded,
    /// Drop a unit whose start would lie further ahead of device time than this.
    DropBeyond(Duration),
}

/// A unit placed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    /// Device time at which the unit starts, in seconds.
    pub start_at: f64,
    /// Length in seconds.
    pub duration: f64,
    pub samples: usize,
}

impl ScheduledUnit {
    pub fn end(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Result of feeding one server message to the scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOutcome {
    pub scheduled: Vec<ScheduledUnit>,
    /// Units that failed to decode or schedule.
    pub rejected: usize,
    /// Units cut off by an interruption in this message.
    pub interrupted: Option<usize>,
}

/// Single consumer of inbound audio for one session.
pub struct PlaybackScheduler {
    timeline: Arc<PlaybackTimeline>,
    cursor: f64,
    active: HashSet<UnitId>,
    next_id: UnitId,
    lag_policy: LagPolicy,
}

impl PlaybackScheduler {
    pub fn new(timeline: Arc<PlaybackTimeline>, lag_policy: LagPolicy) -> Self {
        Self {
            timeline,
            cursor: 0.0,
            active: HashSet::new(),
            next_id: 1,
            lag_policy,
        }
    }

    /// End time of the last scheduled unit; zero after an interruption.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: UnitId) -> bool {
        self.active.contains(&id)
    }

    /// Decode one base64 PCM16 payload and schedule it.
    ///
    /// Returns `Ok(None)` for an empty payload or a unit dropped by the lag
    /// policy.
    pub fn enqueue_payload(&mut self, payload: &str) -> VoiceResult<Option<ScheduledUnit>> {
        let samples = pcm::decode_pcm16(payload)?;
        self.enqueue_samples(samples)
    }

    /// Schedule already decoded samples right after the previous unit.
    pub fn enqueue_samples(&mut self, samples: Vec<f32>) -> VoiceResult<Option<ScheduledUnit>> {
        if samples.is_empty() {
            return Ok(None);
        }

        let now = self.timeline.current_time();
        let start_at = self.cursor.max(now);

        if let LagPolicy::DropBeyond(max_lead) = self.lag_policy {
            let lead = start_at - now;
            if lead > max_lead.as_secs_f64() {
                warn!(
                    lead_secs = lead,
                    max_lead_secs = max_lead.as_secs_f64(),
                    "Playback lag too large, dropping unit"
                );
                return Ok(None);
            }
        }

        let sample_count = samples.len();
        let duration = pcm::duration_secs(sample_count, self.timeline.sample_rate());
        let id = self.next_id;

        self.timeline.schedule(id, start_at, samples)?;
        self.next_id += 1;
        self.active.insert(id);
        self.cursor = start_at + duration;

        debug!(unit = id, start_at, duration, "Scheduled playback unit");
        Ok(Some(ScheduledUnit {
            id,
            start_at,
            duration,
            samples: sample_count,
        }))
    }

    /// A unit finished playing on its own.
    pub fn complete(&mut self, id: UnitId) -> bool {
        self.active.remove(&id)
    }

    /// Stop every active unit and reset the cursor.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.drain() {
            self.timeline.stop(id);
        }
        self.cursor = 0.0;
        info!(stopped, "⚡ Playback interrupted");
        stopped
    }

    /// Schedule every audio part of `msg`, then apply its interruption flag.
    ///
    /// A payload that fails to decode is skipped; the rest still play.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> MessageOutcome {
        let mut outcome = MessageOutcome::default();

        for payload in msg.audio_payloads() {
            match self.enqueue_payload(payload) {
                Ok(Some(unit)) => outcome.scheduled.push(unit),
                Ok(None) => {}
                Err(e) => {
                    warn!("Skipping undecodable audio payload: {}", e);
                    outcome.rejected += 1;
                }
            }
        }

        if msg.is_interrupted() {
            outcome.interrupted = Some(self.interrupt());
        }

        outcome
    }
}

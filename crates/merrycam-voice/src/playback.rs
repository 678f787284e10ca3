//! Playback timeline and the rodio output that drains it.
//!
//! The timeline is the output device's notion of time: a sample clock that
//! only moves when audio is rendered, plus the set of units scheduled to
//! start at exact sample positions. The device thread pulls rendered blocks
//! through [`TimelineSource`]; tests drive the clock with
//! [`PlaybackTimeline::advance`].

use crate::backend::DeviceHandle;
use crate::error::{VoiceError, VoiceResult};
use parking_lot::Mutex;
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifier of one scheduled playback unit.
pub type UnitId = u64;

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Sample rate in Hz (default: 24000)
    pub sample_rate: u32,

    /// Frames rendered per pull from the device (default: 480, 20ms at 24kHz)
    pub block_frames: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            block_frames: 480,
        }
    }
}

struct Voice {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
    pos: usize,
}

#[derive(Default)]
struct TimelineInner {
    voices: Vec<Voice>,
    closed: bool,
}

/// Shared mono timeline of scheduled units.
pub struct PlaybackTimeline {
    sample_rate: u32,
    clock: AtomicU64,
    inner: Mutex<TimelineInner>,
    finished_tx: mpsc::UnboundedSender<UnitId>,
}

impl PlaybackTimeline {
    /// Create a timeline. The receiver yields ids of units that finished
    /// playing on their own.
    pub fn new(sample_rate: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<UnitId>) {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let timeline = Arc::new(Self {
            sample_rate,
            clock: AtomicU64::new(0),
            inner: Mutex::new(TimelineInner::default()),
            finished_tx,
        });
        (timeline, finished_rx)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Device time in seconds. Monotonic.
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate as f64
    }

    /// Schedule `samples` to begin at `start_at` seconds of device time.
    ///
    /// A start time already in the past begins with the next rendered block.
    pub fn schedule(&self, id: UnitId, start_at: f64, samples: Vec<f32>) -> VoiceResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(VoiceError::Playback("playback timeline is closed".to_string()));
        }
        let start_frame = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        inner.voices.push(Voice {
            id,
            start_frame,
            samples,
            pos: 0,
        });
        Ok(())
    }

    /// Stop one unit. Returns false if it was not playing or pending.
    pub fn stop(&self, id: UnitId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.voices.len();
        inner.voices.retain(|voice| voice.id != id);
        inner.voices.len() != before
    }

    /// Stop everything and refuse further scheduling.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let count = inner.voices.len();
        inner.voices.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Units scheduled and not yet finished.
    pub fn pending_units(&self) -> usize {
        self.inner.lock().voices.len()
    }

    /// Mix the next `out.len()` frames into `out` and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let mut inner = self.inner.lock();
        let block_start = self.clock.load(Ordering::Acquire);
        let block_end = block_start + out.len() as u64;

        let mut finished = Vec::new();
        for voice in inner.voices.iter_mut() {
            if voice.start_frame >= block_end {
                continue;
            }
            // late starts are not skipped into, they begin at the block head
            let offset = voice.start_frame.saturating_sub(block_start) as usize;
            let remaining = voice.samples.len() - voice.pos;
            let n = remaining.min(out.len() - offset);
            for (dst, src) in out[offset..offset + n]
                .iter_mut()
                .zip(&voice.samples[voice.pos..voice.pos + n])
            {
                *dst += *src;
            }
            voice.pos += n;
            if voice.pos >= voice.samples.len() {
                finished.push(voice.id);
            }
        }

        if !finished.is_empty() {
            inner.voices.retain(|voice| voice.pos < voice.samples.len());
        }
        self.clock.store(block_end, Ordering::Release);
        drop(inner);

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        for id in finished {
            let _ = self.finished_tx.send(id);
        }
    }

    /// Render and discard `frames` frames. Drives the clock without a device.
    pub fn advance(&self, frames: usize) {
        let mut scratch = vec![0.0f32; frames];
        self.render(&mut scratch);
    }

    /// Advance by a wall-clock duration.
    pub fn advance_by(&self, duration: Duration) {
        let frames = (duration.as_secs_f64() * self.sample_rate as f64).round() as usize;
        self.advance(frames);
    }
}

/// Mono rodio source that renders the timeline block by block.
///
/// Ends once the timeline is closed so the sink drains.
pub struct TimelineSource {
    timeline: Arc<PlaybackTimeline>,
    block: Vec<f32>,
    pos: usize,
}

impl TimelineSource {
    pub fn new(timeline: Arc<PlaybackTimeline>, block_frames: usize) -> Self {
        let block_frames = block_frames.max(1);
        Self {
            timeline,
            block: vec![0.0; block_frames],
            pos: block_frames,
        }
    }
}

impl Iterator for TimelineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.pos >= self.block.len() {
            if self.timeline.is_closed() {
                return None;
            }
            self.timeline.render(&mut self.block);
            self.pos = 0;
        }
        let sample = self.block[self.pos];
        self.pos += 1;
        Some(sample)
    }
}

impl Source for TimelineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Open the default output device and play `timeline` on it.
///
/// The rodio stream lives on the returned handle's thread.
pub async fn open_rodio_output(
    config: &PlaybackConfig,
    timeline: Arc<PlaybackTimeline>,
) -> VoiceResult<DeviceHandle> {
    info!("🔊 Initializing audio playback ({}Hz mono)", config.sample_rate);
    let block_frames = config.block_frames;

    DeviceHandle::spawn("playback", move || {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        sink.append(TimelineSource::new(timeline, block_frames));
        debug!("Playback sink attached to timeline");
        Ok(RodioOutput {
            sink,
            _stream: stream,
        })
    })
    .await
}

struct RodioOutput {
    sink: Sink,
    _stream: OutputStream,
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.sink.stop();
        info!("⏹️ Audio playback stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_config_defaults() {
        let config = PlaybackConfig::default();
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.block_frames, 480);
    }

    #[test]
    fn clock_only_moves_when_rendered() {
        let (timeline, _rx) = PlaybackTimeline::new(24000);
        assert_eq!(timeline.current_time(), 0.0);
        timeline.advance(12000);
        assert!((timeline.current_time() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn unit_starts_on_its_exact_frame() {
        let (timeline, _rx) = PlaybackTimeline::new(10);
        // starts at 0.3s = frame 3
        timeline.schedule(1, 0.3, vec![0.5, 0.5]).unwrap();

        let mut out = vec![0.0; 6];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn units_spanning_blocks_continue_seamlessly() {
        let (timeline, mut rx) = PlaybackTimeline::new(10);
        timeline.schedule(7, 0.0, vec![0.1, 0.2, 0.3, 0.4, 0.5]).unwrap();

        let mut first = vec![0.0; 3];
        timeline.render(&mut first);
        assert_eq!(first, vec![0.1, 0.2, 0.3]);
        assert!(rx.try_recv().is_err());

        let mut second = vec![0.0; 3];
        timeline.render(&mut second);
        assert_eq!(second, vec![0.4, 0.5, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(timeline.pending_units(), 0);
    }

    #[test]
    fn late_start_begins_at_block_head() {
        let (timeline, _rx) = PlaybackTimeline::new(10);
        timeline.advance(5);
        timeline.schedule(1, 0.1, vec![0.25]).unwrap();

        let mut out = vec![0.0; 2];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.25, 0.0]);
    }

    #[test]
    fn mix_is_clamped() {
        let (timeline, _rx) = PlaybackTimeline::new(10);
        timeline.schedule(1, 0.0, vec![0.8]).unwrap();
        timeline.schedule(2, 0.0, vec![0.8]).unwrap();
        let mut out = vec![0.0; 1];
        timeline.render(&mut out);
        assert_eq!(out, vec![1.0]);
    }

    #[test]
    fn stopped_units_do_not_report_completion() {
        let (timeline, mut rx) = PlaybackTimeline::new(10);
        timeline.schedule(1, 0.0, vec![0.1; 4]).unwrap();
        timeline.schedule(2, 0.0, vec![0.1; 4]).unwrap();
        assert!(timeline.stop(1));
        assert!(!timeline.stop(1));
        assert_eq!(timeline.close(), 1);

        timeline.advance(10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_timeline_rejects_units() {
        let (timeline, _rx) = PlaybackTimeline::new(10);
        timeline.schedule(1, 0.0, vec![0.1; 4]).unwrap();
        assert_eq!(timeline.close(), 1);
        assert!(timeline.is_closed());
        assert!(timeline.schedule(2, 0.0, vec![0.1]).is_err());
    }

    #[test]
    fn source_ends_after_close() {
        let (timeline, _rx) = PlaybackTimeline::new(24000);
        let mut source = TimelineSource::new(Arc::clone(&timeline), 4);
        assert_eq!(source.channels(), 1);
        assert_eq!(source.sample_rate(), 24000);
        assert_eq!(source.by_ref().take(4).count(), 4);
        timeline.close();
        assert!(source.next().is_none());
    }
}

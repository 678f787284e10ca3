//! Microphone capture (cpal) and the encode path towards the remote channel.

use crate::backend::DeviceHandle;
use crate::error::{VoiceError, VoiceResult};
use crate::pcm;
use crate::protocol::ClientMessage;
use crate::resample::CaptureResampler;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capture configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per block handed to the encoder (default: 4096)
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 4096,
        }
    }
}

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }
}

/// Regroups device callbacks of arbitrary length into fixed-size blocks.
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples, calling `emit` for every completed block.
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        for &sample in data {
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_size {
                let block = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_size));
                emit(block);
            }
        }
    }

    /// Samples waiting for the block to fill.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Average interleaved frames down to one channel, appending to `out`.
pub fn downmix_into(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(data);
        return;
    }
    out.extend(
        data.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::F32 => Some(0),
        SampleFormat::I16 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

/// Pick the device input config closest to what the model wants.
///
/// Ranges that contain `target_rate` win; otherwise the nearest supported
/// rate is taken and the resampler makes up the difference. Ties go to the
/// cheaper sample format, then to the channel count closest to the target.
pub fn choose_input_config<I>(
    ranges: I,
    target_rate: u32,
    target_channels: u16,
) -> Option<SupportedStreamConfig>
where
    I: IntoIterator<Item = SupportedStreamConfigRange>,
{
    ranges
        .into_iter()
        .filter(|range| range.channels() > 0 && range.min_sample_rate() <= range.max_sample_rate())
        .filter_map(|range| {
            let rank = format_rank(range.sample_format())?;
            let rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
            let score = (
                rate.abs_diff(target_rate),
                rank,
                range.channels().abs_diff(target_channels),
            );
            Some((score, range, rate))
        })
        .min_by_key(|(score, _, _)| *score)
        .map(|(_, range, rate)| range.with_sample_rate(SampleRate(rate)))
}

/// Device samples in, model-ready blocks out: downmix, resample, frame.
pub struct CapturePipeline {
    channels: usize,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    resampler: CaptureResampler,
    accumulator: FrameAccumulator,
}

impl CapturePipeline {
    pub fn new(device_rate: u32, device_channels: u16, config: &CaptureConfig) -> VoiceResult<Self> {
        Ok(Self {
            channels: device_channels.max(1) as usize,
            mono: Vec::new(),
            resampled: Vec::new(),
            resampler: CaptureResampler::new(device_rate, config.sample_rate)?,
            accumulator: FrameAccumulator::new(config.frame_size),
        })
    }

    /// Feed one device callback; `emit` gets every completed block.
    pub fn push(&mut self, data: &[f32], emit: impl FnMut(Vec<f32>)) -> VoiceResult<()> {
        self.mono.clear();
        downmix_into(data, self.channels, &mut self.mono);
        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled)?;
        self.accumulator.push(&self.resampled, emit);
        Ok(())
    }
}

/// Audio capture system using CPAL
pub struct MicCapture {
    config: CaptureConfig,
    device: Device,
    device_config: SupportedStreamConfig,
}

impl MicCapture {
    /// Bind the default input device and negotiate a config it supports.
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let device_config = match choose_input_config(
            device.supported_input_configs()?,
            config.sample_rate,
            config.channels,
        ) {
            Some(chosen) => chosen,
            None => {
                let fallback = device.default_input_config()?;
                warn!("No usable input range; falling back to {:?}", fallback);
                fallback
            }
        };
        debug!("🔧 Input config: {:?}", device_config);

        if device_config.sample_rate().0 != config.sample_rate || device_config.channels() != config.channels {
            info!(
                "🔁 Converting {}Hz/{}ch to {}Hz/{}ch",
                device_config.sample_rate().0,
                device_config.channels(),
                config.sample_rate,
                config.channels
            );
        }

        Ok(Self {
            config,
            device,
            device_config,
        })
    }

    /// Start the input stream. Blocks go to `chunk_tx` without ever waiting:
    /// a full queue drops the block.
    pub fn start(self, chunk_tx: mpsc::Sender<AudioChunk>) -> VoiceResult<Stream> {
        info!("▶️ Starting audio capture stream");

        let pipeline = CapturePipeline::new(
            self.device_config.sample_rate().0,
            self.device_config.channels(),
            &self.config,
        )?;
        let stream_config: StreamConfig = self.device_config.config();

        let stream = match self.device_config.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&self.device, &stream_config, pipeline, chunk_tx)?,
            SampleFormat::I16 => build_input::<i16>(&self.device, &stream_config, pipeline, chunk_tx)?,
            SampleFormat::U16 => build_input::<u16>(&self.device, &stream_config, pipeline, chunk_tx)?,
            other => {
                return Err(VoiceError::AudioStream(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

fn build_input<T>(
    device: &Device,
    stream_config: &StreamConfig,
    mut pipeline: CapturePipeline,
    chunk_tx: mpsc::Sender<AudioChunk>,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut converted = Vec::new();
    let stream = device.build_input_stream(
        stream_config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            converted.clear();
            converted.extend(data.iter().map(|&sample| f32::from_sample_(sample)));
            let pushed = pipeline.push(&converted, |block| {
                if let Err(e) = chunk_tx.try_send(AudioChunk::new(block)) {
                    debug!("Dropping capture block: {}", e);
                }
            });
            if let Err(e) = pushed {
                warn!("Capture conversion failed: {}", e);
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

/// Open the default microphone on its own thread.
pub async fn open_cpal_capture(
    config: &CaptureConfig,
    frames: mpsc::Sender<AudioChunk>,
) -> VoiceResult<DeviceHandle> {
    let config = config.clone();
    DeviceHandle::spawn("capture", move || MicCapture::new(config)?.start(frames)).await
}

/// Counters for one run of the encode path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Encode captured blocks and hand them to the channel in capture order.
///
/// Runs until the capture device goes away. A frame the channel cannot take
/// right now is dropped; the next one tries again.
pub async fn pump_frames(
    mut frames: mpsc::Receiver<AudioChunk>,
    outbound: mpsc::Sender<ClientMessage>,
) -> CaptureStats {
    let mut stats = CaptureStats::default();
    while let Some(chunk) = frames.recv().await {
        let message = ClientMessage::audio(pcm::encode_pcm16(&chunk.samples));
        match outbound.try_send(message) {
            Ok(()) => stats.sent += 1,
            Err(e) => {
                stats.dropped += 1;
                debug!(dropped = stats.dropped, "Dropping outbound frame: {}", e);
            }
        }
    }
    debug!(sent = stats.sent, dropped = stats.dropped, "Capture path finished");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CAPTURE_MIME_TYPE;
    use cpal::SupportedBufferSize;

    #[test]
    fn test_capture_config_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frame_size, 4096);
    }

    #[test]
    fn accumulator_emits_fixed_blocks() {
        let mut acc = FrameAccumulator::new(4);
        let mut blocks = Vec::new();
        acc.push(&[1.0, 2.0, 3.0], |b| blocks.push(b));
        assert!(blocks.is_empty());
        acc.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |b| blocks.push(b));
        assert_eq!(blocks, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(acc.pending(), 1);
    }

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn negotiation_prefers_a_range_with_the_model_rate() {
        let ranges = vec![
            range(2, 44100, 48000, SampleFormat::F32),
            range(1, 8000, 48000, SampleFormat::I16),
        ];
        let chosen = choose_input_config(ranges, 16000, 1).unwrap();
        assert_eq!(chosen.sample_rate().0, 16000);
        assert_eq!(chosen.channels(), 1);
        assert_eq!(chosen.sample_format(), SampleFormat::I16);
    }

    #[test]
    fn negotiation_falls_back_to_nearest_rate() {
        // a typical USB mic: stereo at 44.1 or 48 kHz only
        let ranges = vec![
            range(2, 48000, 48000, SampleFormat::F32),
            range(2, 44100, 44100, SampleFormat::F32),
            range(2, 8000, 96000, SampleFormat::I32),
        ];
        let chosen = choose_input_config(ranges, 16000, 1).unwrap();
        assert_eq!(chosen.sample_rate().0, 44100);
        assert_eq!(chosen.channels(), 2);
        assert_eq!(chosen.sample_format(), SampleFormat::F32);

        assert!(choose_input_config(Vec::new(), 16000, 1).is_none());
    }

    #[test]
    fn downmix_averages_channels() {
        let mut mono = Vec::new();
        downmix_into(&[0.2, 0.4, -1.0, 1.0, 0.5], 2, &mut mono);
        // trailing partial frame is dropped
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(mono[1], 0.0);
    }

    #[test]
    fn pipeline_turns_stereo_48k_into_16k_blocks() {
        let config = CaptureConfig {
            frame_size: 1600,
            ..CaptureConfig::default()
        };
        let mut pipeline = CapturePipeline::new(48000, 2, &config).unwrap();

        // one second of stereo in 10 ms callbacks
        let callback = vec![0.25f32; 960];
        let mut blocks = Vec::new();
        for _ in 0..100 {
            pipeline.push(&callback, |block| blocks.push(block)).unwrap();
        }

        assert!((9..=10).contains(&blocks.len()), "got {} blocks", blocks.len());
        assert!(blocks.iter().all(|b| b.len() == 1600));
    }

    #[test]
    fn pipeline_at_model_rate_only_frames() {
        let config = CaptureConfig {
            frame_size: 4,
            ..CaptureConfig::default()
        };
        let mut pipeline = CapturePipeline::new(16000, 1, &config).unwrap();
        let mut blocks = Vec::new();
        pipeline
            .push(&[0.1, 0.2, 0.3, 0.4, 0.5], |block| blocks.push(block))
            .unwrap();
        assert_eq!(blocks, vec![vec![0.1, 0.2, 0.3, 0.4]]);
    }

    #[tokio::test]
    async fn pump_sends_in_capture_order() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        frame_tx.send(AudioChunk::new(vec![0.5])).await.unwrap();
        frame_tx.send(AudioChunk::new(vec![-0.5])).await.unwrap();
        drop(frame_tx);

        let stats = pump_frames(frame_rx, out_tx).await;
        assert_eq!(stats, CaptureStats { sent: 2, dropped: 0 });

        let expected = [pcm::encode_pcm16(&[0.5]), pcm::encode_pcm16(&[-0.5])];
        for want in expected {
            match out_rx.recv().await.unwrap() {
                ClientMessage::RealtimeInput(input) => {
                    assert_eq!(input.media_chunks[0].mime_type, CAPTURE_MIME_TYPE);
                    assert_eq!(input.media_chunks[0].data, want);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn pump_drops_when_channel_is_full_or_gone() {
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(1);

        for _ in 0..3 {
            frame_tx.send(AudioChunk::new(vec![0.0; 16])).await.unwrap();
        }
        drop(frame_tx);

        let stats = pump_frames(frame_rx, out_tx).await;
        assert_eq!(stats, CaptureStats { sent: 1, dropped: 2 });
        drop(out_rx);
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = MicCapture::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}

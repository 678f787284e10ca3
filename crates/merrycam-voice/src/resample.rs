//! Sample-rate conversion for the microphone path.
//!
//! Devices rarely run at the 16 kHz the live model expects, so captured
//! mono audio goes through a sinc resampler before it is framed.

use crate::error::{VoiceError, VoiceResult};
use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Mono resampler fed with device callbacks of any length.
pub struct CaptureResampler {
    source_rate: u32,
    target_rate: u32,
    inner: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
}

impl CaptureResampler {
    /// Equal rates give a passthrough that copies input unchanged.
    pub fn new(source_rate: u32, target_rate: u32) -> VoiceResult<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(VoiceError::Resample("Sample rate cannot be zero".to_string()));
        }

        let inner = if source_rate != target_rate {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            // 100 ms per pass
            let chunk_size = (source_rate as usize / 10).max(1);
            let resampler = SincFixedIn::<f32>::new(
                target_rate as f64 / source_rate as f64,
                2.0,
                params,
                chunk_size,
                1,
            )
            .map_err(|e| VoiceError::Resample(format!("Failed to create resampler: {:?}", e)))?;
            Some(resampler)
        } else {
            None
        };

        Ok(Self {
            source_rate,
            target_rate,
            inner,
            pending: Vec::new(),
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Append the converted form of `input` to `out`. Input that does not
    /// fill a whole pass waits for the next call.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> VoiceResult<()> {
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }
            let planar = resampler
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| VoiceError::Resample(format!("Resampling failed: {:?}", e)))?;
            if let Some(channel) = planar.first() {
                out.extend_from_slice(channel);
            }
            self.pending.drain(..needed);
        }
    }

    /// Input samples held back until a full pass is available.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

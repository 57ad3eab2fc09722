//! Format conversion node
//!
//! Converts sample representation, remixes channels and, when the input and
//! output rates differ, resamples with `rubato`. Rate-identical conversions
//! map every input frame to exactly one output frame and keep no state
//! between calls.

use parking_lot::Mutex;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::marker::PhantomData;

use crate::error::AudioError;
use crate::stream::{Consumer, Outlet, Producer, Sample, StreamFormat};

/// Resampler chunk length in milliseconds of input
const RESAMPLER_CHUNK_MS: u32 = 10;

pub struct FormatConverter<I, O> {
    input: StreamFormat,
    output: StreamFormat,
    outlet: Outlet<O>,
    state: Mutex<ConvertState<O>>,
    _input: PhantomData<fn(&[I])>,
}

struct ConvertState<O> {
    scratch: Vec<O>,
    rate: Option<RateStage>,
}

/// Resampling filter plus the planar input it has not consumed yet
struct RateStage {
    resampler: FastFixedIn<f32>,
    pending: Vec<Vec<f32>>,
}

impl RateStage {
    fn new(input: StreamFormat, output: StreamFormat) -> Result<Self, AudioError> {
        let ratio = output.sample_rate as f64 / input.sample_rate as f64;
        let chunk = (input.sample_rate * RESAMPLER_CHUNK_MS / 1000).max(1) as usize;
        let channels = output.channels as usize;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk, channels)
            .map_err(|e| AudioError::UnsupportedFormat(format!("resampler: {}", e)))?;
        Ok(Self {
            resampler,
            pending: vec![Vec::with_capacity(chunk * 2); channels],
        })
    }

    /// Feed planar input, return interleaved output
    fn process<O: Sample>(&mut self, out: &mut Vec<O>) -> Result<(), rubato::ResampleError> {
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending[0].len() < needed {
                return Ok(());
            }
            let chunk: Vec<&[f32]> = self.pending.iter().map(|c| &c[..needed]).collect();
            let resampled = self.resampler.process(&chunk, None)?;
            for channel in &mut self.pending {
                channel.drain(..needed);
            }
            let frames = resampled.first().map_or(0, |c| c.len());
            for frame in 0..frames {
                for channel in &resampled {
                    out.push(O::from_f32(channel[frame]));
                }
            }
        }
    }
}

impl<I: Sample, O: Sample> FormatConverter<I, O> {
    pub fn new(input: StreamFormat, output: StreamFormat) -> Result<Self, AudioError> {
        if input.channels == 0 || output.channels == 0 {
            return Err(AudioError::InvalidParams("channel count must be non-zero".into()));
        }
        if input.sample_rate == 0 || output.sample_rate == 0 {
            return Err(AudioError::InvalidParams("sample rate must be non-zero".into()));
        }
        let rate = if input.sample_rate != output.sample_rate {
            Some(RateStage::new(input, output)?)
        } else {
            None
        };
        tracing::debug!(
            "Converter {} {} Hz x{} -> {} {} Hz x{}",
            I::FORMAT,
            input.sample_rate,
            input.channels,
            O::FORMAT,
            output.sample_rate,
            output.channels
        );
        Ok(Self {
            input,
            output,
            outlet: Outlet::new(),
            state: Mutex::new(ConvertState {
                scratch: Vec::new(),
                rate,
            }),
            _input: PhantomData,
        })
    }

    /// Same rate and channel count, representation change only
    pub fn same_format(format: StreamFormat) -> Self {
        Self {
            input: format,
            output: format,
            outlet: Outlet::new(),
            state: Mutex::new(ConvertState {
                scratch: Vec::new(),
                rate: None,
            }),
            _input: PhantomData,
        }
    }

    pub fn input_format(&self) -> StreamFormat {
        self.input
    }

    pub fn output_format(&self) -> StreamFormat {
        self.output
    }

    /// Drop resampler history. No-op for rate-identical conversions.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.rate.is_some() {
            match RateStage::new(self.input, self.output) {
                Ok(stage) => state.rate = Some(stage),
                Err(e) => tracing::warn!("Failed to rebuild resampler: {}", e),
            }
        }
        state.scratch.clear();
    }
}

impl<I: Sample, O: Sample> Consumer<I> for FormatConverter<I, O> {
    fn consume(&self, samples: &[I]) {
        let in_ch = self.input.channels as usize;
        let out_ch = self.output.channels as usize;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.scratch.clear();

        match state.rate.as_mut() {
            None => {
                for frame in samples.chunks_exact(in_ch) {
                    for c in 0..out_ch {
                        state.scratch.push(O::from_f32(remix(frame, c, out_ch)));
                    }
                }
            }
            Some(stage) => {
                for frame in samples.chunks_exact(in_ch) {
                    for (c, channel) in stage.pending.iter_mut().enumerate() {
                        channel.push(remix(frame, c, out_ch));
                    }
                }
                if let Err(e) = stage.process(&mut state.scratch) {
                    tracing::warn!("Resampling failed, dropping block: {}", e);
                    for channel in &mut stage.pending {
                        channel.clear();
                    }
                    state.scratch.clear();
                }
            }
        }

        if !state.scratch.is_empty() {
            self.outlet.push(&state.scratch);
        }
    }
}

impl<I: Sample, O: Sample> Producer<O> for FormatConverter<I, O> {
    fn outlet(&self) -> &Outlet<O> {
        &self.outlet
    }
}

/// Output channel `c` of a frame, as normalized f32
fn remix<T: Sample>(frame: &[T], c: usize, out_channels: usize) -> f32 {
    let in_channels = frame.len();
    if in_channels == out_channels {
        frame[c].to_f32()
    } else if out_channels == 1 {
        frame.iter().map(|s| s.to_f32()).sum::<f32>() / in_channels as f32
    } else {
        frame[c % in_channels].to_f32()
    }
}

/// Remix a whole interleaved buffer to another channel count
pub fn remix_interleaved<T: Sample>(samples: &[T], in_channels: u16, out_channels: u16) -> Vec<T> {
    if in_channels == out_channels || in_channels == 0 || out_channels == 0 {
        return samples.to_vec();
    }
    let out_ch = out_channels as usize;
    samples
        .chunks_exact(in_channels as usize)
        .flat_map(|frame| (0..out_ch).map(move |c| T::from_f32(remix(frame, c, out_ch))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::Collector;
    use std::sync::Arc;

    #[test]
    fn test_i16_to_f32_preserves_frame_count() {
        let converter = FormatConverter::<i16, f32>::same_format(StreamFormat::mono(48000));
        let sink = Arc::new(Collector::new());
        converter.attach(&sink);

        converter.consume(&[0, 16384, -16384, 32767]);
        converter.consume(&[-32768]);

        let out = sink.samples();
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] + 0.5).abs() < 1e-6);
        assert_eq!(out[4], -1.0);
    }

    #[test]
    fn test_f32_to_i16_round_trip_is_exact() {
        let to_float = FormatConverter::<i16, f32>::same_format(StreamFormat::mono(16000));
        let to_int = Arc::new(FormatConverter::<f32, i16>::same_format(StreamFormat::mono(16000)));
        let sink = Arc::new(Collector::new());
        to_float.attach(&to_int);
        to_int.attach(&sink);

        let input: Vec<i16> = (-500..500).map(|v| v * 37).collect();
        to_float.consume(&input);
        assert_eq!(sink.samples(), input);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let converter = FormatConverter::<f32, f32>::new(
            StreamFormat::new(48000, 2),
            StreamFormat::mono(48000),
        )
        .unwrap();
        let sink = Arc::new(Collector::new());
        converter.attach(&sink);

        converter.consume(&[1.0, 0.0, 0.5, 0.5, -1.0, 1.0]);
        assert_eq!(sink.samples(), vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let converter = FormatConverter::<i16, i16>::new(
            StreamFormat::mono(48000),
            StreamFormat::new(48000, 2),
        )
        .unwrap();
        let sink = Arc::new(Collector::new());
        converter.attach(&sink);

        converter.consume(&[100, -200]);
        assert_eq!(sink.samples(), vec![100, 100, -200, -200]);
    }

    #[test]
    fn test_resampling_halves_frame_count() {
        let converter = FormatConverter::<f32, f32>::new(
            StreamFormat::mono(48000),
            StreamFormat::mono(24000),
        )
        .unwrap();
        let sink = Arc::new(Collector::new());
        converter.attach(&sink);

        // 1 second of input in irregular blocks
        let input = vec![0.25f32; 48000];
        for block in input.chunks(733) {
            converter.consume(block);
        }

        let produced = sink.samples().len();
        // One chunk of input may still be pending inside the resampler
        assert!(produced <= 24000, "produced {}", produced);
        assert!(produced >= 24000 - 480, "produced {}", produced);
    }

    #[test]
    fn test_rejects_zero_channels() {
        let result = FormatConverter::<i16, f32>::new(StreamFormat::new(48000, 0), StreamFormat::mono(48000));
        assert!(result.is_err());
    }

    #[test]
    fn test_remix_interleaved() {
        let stereo: Vec<i16> = vec![100, 300, -100, -300];
        assert_eq!(remix_interleaved(&stereo, 2, 1), vec![200, -200]);
    }
}

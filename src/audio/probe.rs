//! Probe and calibration signals for the loop player
//!
//! The probe is a fixed multi-frequency waveform in the near-ultrasound
//! band, played on repeat while a call runs so the round-trip latency of
//! device and transport can be estimated on the far side. It can also be
//! loaded from a WAV file.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

use crate::audio::host::DeviceSample;
use crate::config::ProbeConfig;
use crate::error::AudioError;
use crate::stream::convert::remix_interleaved;
use crate::stream::{Consumer, FormatConverter, Producer, Sample, StreamFormat};

/// Interleaved samples plus the format they were recorded in
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<DeviceSample>,
    pub format: StreamFormat,
}

/// Equal-weight sum of sines, scaled so the peak never exceeds `amplitude`.
/// Every channel carries the same signal.
pub fn multitone(
    format: StreamFormat,
    frequencies: &[f32],
    amplitude: f32,
    duration_secs: f32,
) -> Vec<DeviceSample> {
    let frames = (format.sample_rate as f32 * duration_secs.max(0.0)) as usize;
    let channels = format.channels as usize;
    if frequencies.is_empty() || frames == 0 || channels == 0 {
        return vec![0; frames * channels];
    }

    let gain = amplitude.clamp(0.0, 1.0) / frequencies.len() as f32;
    let rate = format.sample_rate as f64;
    let mut out = Vec::with_capacity(frames * channels);
    for n in 0..frames {
        let t = n as f64 / rate;
        let value: f64 = frequencies
            .iter()
            .map(|&f| (2.0 * std::f64::consts::PI * f as f64 * t).sin())
            .sum();
        let sample = DeviceSample::from_f32(value as f32 * gain);
        out.extend(std::iter::repeat(sample).take(channels));
    }
    out
}

/// Read a PCM or float WAV file into 16-bit samples
pub fn load_wav(path: &Path) -> Result<Clip, AudioError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| AudioError::Wav(format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();
    let wav_err = |e: hound::Error| AudioError::Wav(format!("{}: {}", path.display(), e));

    let samples: Vec<DeviceSample> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        (hound::SampleFormat::Int, bits) if (1..=32).contains(&bits) => {
            let scale = 1.0 / (1u64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| DeviceSample::from_f32(v as f32 * scale)))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(DeviceSample::from_f32))
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
        (format, bits) => {
            return Err(AudioError::Wav(format!(
                "{}: unsupported sample format {:?}/{} bits",
                path.display(),
                format,
                bits
            )))
        }
    };

    tracing::debug!(
        "Loaded {} ({} samples, {} Hz, {} ch)",
        path.display(),
        samples.len(),
        spec.sample_rate,
        spec.channels
    );
    Ok(Clip {
        samples,
        format: StreamFormat::new(spec.sample_rate, spec.channels),
    })
}

/// Collects everything a converter emits
struct Gather(Mutex<Vec<DeviceSample>>);

impl Consumer<DeviceSample> for Gather {
    fn consume(&self, samples: &[DeviceSample]) {
        self.0.lock().extend_from_slice(samples);
    }
}

/// Convert a clip to the player's rate and channel count
pub fn fit_to(clip: Clip, target: StreamFormat) -> Result<Vec<DeviceSample>, AudioError> {
    if clip.format.sample_rate == target.sample_rate {
        return Ok(remix_interleaved(
            &clip.samples,
            clip.format.channels,
            target.channels,
        ));
    }
    let converter = FormatConverter::<DeviceSample, DeviceSample>::new(clip.format, target)?;
    let gather = Arc::new(Gather(Mutex::new(Vec::new())));
    converter.attach(&gather);
    converter.consume(&clip.samples);
    converter.detach_all();
    let out = std::mem::take(&mut *gather.0.lock());
    Ok(out)
}

/// Build the loop content described by `config`, or `None` when disabled
pub fn build_probe(
    config: &ProbeConfig,
    format: StreamFormat,
) -> Result<Option<Arc<[DeviceSample]>>, AudioError> {
    if !config.enabled {
        return Ok(None);
    }
    let samples = match &config.wav_path {
        Some(path) => fit_to(load_wav(path)?, format)?,
        None => multitone(
            format,
            &config.frequencies,
            config.amplitude,
            config.duration_secs,
        ),
    };
    tracing::info!(
        "Probe ready: {:.1} s at {} Hz",
        samples.len() as f32 / format.samples(format.sample_rate as usize) as f32,
        format.sample_rate
    );
    Ok(Some(samples.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_multitone_length_and_peak() {
        let format = StreamFormat::mono(48000);
        let tone = multitone(format, &[16000.0, 16300.0, 16600.0], 0.8, 0.5);
        assert_eq!(tone.len(), 24000);
        let peak = tone.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak as f32 <= 0.8 * 32768.0 + 1.0);
        assert!(peak > 0);
        assert_eq!(tone[0], 0);
    }

    #[test]
    fn test_multitone_duplicates_channels() {
        let tone = multitone(StreamFormat::new(48000, 2), &[1000.0], 0.5, 0.01);
        assert_eq!(tone.len(), 960);
        assert!(tone.chunks(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn test_multitone_without_frequencies_is_silent() {
        let tone = multitone(StreamFormat::mono(8000), &[], 0.8, 0.1);
        assert_eq!(tone.len(), 800);
        assert!(tone.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_load_wav_and_fit_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.wav");
        write_wav(&path, 48000, 2, &[100, 300, -200, -400]);

        let clip = load_wav(&path).unwrap();
        assert_eq!(clip.format, StreamFormat::new(48000, 2));
        assert_eq!(clip.samples, vec![100, 300, -200, -400]);

        let mono = fit_to(clip, StreamFormat::mono(48000)).unwrap();
        assert_eq!(mono, vec![200, -300]);
    }

    #[test]
    fn test_fit_resamples_to_player_rate() {
        let clip = Clip {
            samples: vec![1000; 16000],
            format: StreamFormat::mono(16000),
        };
        let out = fit_to(clip, StreamFormat::mono(48000)).unwrap();
        // Close to 3x; the resampler holds back at most one partial chunk
        assert!(out.len() > 45000 && out.len() <= 48100, "got {}", out.len());
    }

    #[test]
    fn test_missing_wav_is_an_error() {
        let err = load_wav(Path::new("/nonexistent/probe.wav")).unwrap_err();
        assert!(matches!(err, AudioError::Wav(_)));
    }

    #[test]
    fn test_build_probe_respects_enabled() {
        let mut config = ProbeConfig::default();
        config.enabled = false;
        assert!(build_probe(&config, StreamFormat::mono(48000)).unwrap().is_none());

        config.enabled = true;
        config.duration_secs = 0.1;
        let probe = build_probe(&config, StreamFormat::mono(48000)).unwrap().unwrap();
        assert_eq!(probe.len(), 4800);
    }
}

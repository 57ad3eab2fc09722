//! Sample representations carried by the pipeline
//!
//! Only two representations occur: 16-bit integer at the device and
//! transport boundaries, 32-bit float around the watermark model.

use std::fmt;

/// Closed set of supported sample representations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleFormat::I16 => write!(f, "i16"),
            SampleFormat::F32 => write!(f, "f32"),
        }
    }
}

pub trait Sample: Copy + Default + PartialEq + Send + Sync + 'static {
    const FORMAT: SampleFormat;
    const SILENCE: Self;

    /// Normalized value in [-1.0, 1.0]
    fn to_f32(self) -> f32;

    /// Saturating conversion from a normalized value
    fn from_f32(value: f32) -> Self;

    /// Exact for i16 -> i16 and f32 -> f32
    fn convert<S: Sample>(self) -> S {
        S::from_f32(self.to_f32())
    }
}

impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
    const SILENCE: Self = 0;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32 / 32768.0
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        // `as` saturates, NaN maps to 0
        (value * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
    const SILENCE: Self = 0.0;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

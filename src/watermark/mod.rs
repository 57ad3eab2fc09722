//! Watermark model collaborators
//!
//! The embedding and detection models are black boxes that work on fixed
//! windows of mono `f32` audio. [`EmbedderNode`] and [`DetectorNode`] put
//! them into the stream graph.

pub mod detect;
pub mod embed;

pub use detect::{DetectorNode, ResultsCallback, ResultsSlot};
pub use embed::EmbedderNode;

use crate::error::ModelError;

/// Transforms a window of audio into watermarked audio
pub trait WatermarkEmbedder: Send {
    fn input_rate(&self) -> u32;

    fn output_rate(&self) -> u32;

    /// Input frames per call to [`embed`](Self::embed)
    fn window_frames(&self) -> usize;

    /// Append the watermarked version of `window` to `out`
    fn embed(&mut self, window: &[f32], out: &mut Vec<f32>) -> Result<(), ModelError>;
}

/// Scores a window of audio for the presence of a watermark
pub trait WatermarkDetector: Send {
    fn sample_rate(&self) -> u32;

    fn window_frames(&self) -> usize;

    /// Probability in `0..=1` that `window` carries the watermark
    fn detect(&mut self, window: &[f32]) -> Result<f32, ModelError>;
}

/// Pass-through embedder
#[derive(Debug, Clone)]
pub struct IdentityEmbedder {
    sample_rate: u32,
    window_frames: usize,
}

impl IdentityEmbedder {
    pub fn new(sample_rate: u32, window_frames: usize) -> Self {
        Self {
            sample_rate,
            window_frames,
        }
    }
}

impl WatermarkEmbedder for IdentityEmbedder {
    fn input_rate(&self) -> u32 {
        self.sample_rate
    }

    fn output_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_frames(&self) -> usize {
        self.window_frames
    }

    fn embed(&mut self, window: &[f32], out: &mut Vec<f32>) -> Result<(), ModelError> {
        if window.len() != self.window_frames {
            return Err(ModelError::InvalidWindow {
                expected: self.window_frames,
                actual: window.len(),
            });
        }
        out.extend_from_slice(window);
        Ok(())
    }
}

/// Detector that reports the same probability for every window
#[derive(Debug, Clone)]
pub struct ConstantDetector {
    sample_rate: u32,
    window_frames: usize,
    probability: f32,
}

impl ConstantDetector {
    pub fn new(sample_rate: u32, window_frames: usize, probability: f32) -> Self {
        Self {
            sample_rate,
            window_frames,
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl WatermarkDetector for ConstantDetector {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn window_frames(&self) -> usize {
        self.window_frames
    }

    fn detect(&mut self, window: &[f32]) -> Result<f32, ModelError> {
        if window.len() != self.window_frames {
            return Err(ModelError::InvalidWindow {
                expected: self.window_frames,
                actual: window.len(),
            });
        }
        Ok(self.probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_embedder_checks_window() {
        let mut embedder = IdentityEmbedder::new(16000, 4);
        let mut out = Vec::new();
        embedder.embed(&[0.1, 0.2, 0.3, 0.4], &mut out).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);

        assert!(matches!(
            embedder.embed(&[0.1], &mut out),
            Err(ModelError::InvalidWindow {
                expected: 4,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_constant_detector_clamps() {
        let mut detector = ConstantDetector::new(16000, 2, 1.5);
        assert_eq!(detector.detect(&[0.0, 0.0]).unwrap(), 1.0);
    }
}

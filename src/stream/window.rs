//! Variable-to-fixed windowing node
//!
//! Re-chunks irregular blocks (as delivered by the network) into the fixed
//! window the watermark model requires. A partial window is kept until the
//! rest of it arrives.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AudioError;
use crate::stream::{Consumer, OverflowPolicy, Outlet, Producer, Sample, StreamFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Frames per emitted window
    pub window_frames: usize,
    /// Frames the window advances by; equal to `window_frames` for
    /// non-overlapping windows
    pub step_frames: usize,
    /// Upper bound on retained input, in steps
    pub max_retained_blocks: usize,
    pub policy: OverflowPolicy,
}

impl WindowConfig {
    pub fn contiguous(window_frames: usize, max_retained_blocks: usize) -> Self {
        Self {
            window_frames,
            step_frames: window_frames,
            max_retained_blocks,
            policy: OverflowPolicy::DropOldest,
        }
    }
}

pub struct Windower<T> {
    format: StreamFormat,
    window: usize,
    step: usize,
    limit: usize,
    policy: OverflowPolicy,
    outlet: Outlet<T>,
    pending: Mutex<Vec<T>>,
    dropped: AtomicU64,
}

impl<T: Sample> Windower<T> {
    pub fn new(format: StreamFormat, config: WindowConfig) -> Result<Self, AudioError> {
        if config.window_frames == 0 || config.step_frames == 0 {
            return Err(AudioError::InvalidParams("window and step must be non-zero".into()));
        }
        if config.step_frames > config.window_frames {
            return Err(AudioError::InvalidParams(format!(
                "step {} exceeds window {}",
                config.step_frames, config.window_frames
            )));
        }
        if format.channels == 0 {
            return Err(AudioError::InvalidParams("channel count must be non-zero".into()));
        }
        let window = format.samples(config.window_frames);
        let step = format.samples(config.step_frames);
        let limit = (step * config.max_retained_blocks).max(window);
        Ok(Self {
            format,
            window,
            step,
            limit,
            policy: config.policy,
            outlet: Outlet::new(),
            pending: Mutex::new(Vec::with_capacity(limit)),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Window length in interleaved samples
    pub fn window_len(&self) -> usize {
        self.window
    }

    /// Samples retained for the next window
    pub fn buffered(&self) -> usize {
        self.pending.lock().len()
    }

    /// Samples discarded by the retention bound
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard any partial window
    pub fn reset(&self) {
        self.pending.lock().clear();
    }
}

impl<T: Sample> Consumer<T> for Windower<T> {
    fn consume(&self, samples: &[T]) {
        let mut pending = self.pending.lock();

        match self.policy {
            OverflowPolicy::DropOldest => {
                pending.extend_from_slice(samples);
                if pending.len() > self.limit {
                    // Whole steps only, so window boundaries stay aligned
                    let excess = pending.len() - self.limit;
                    let drop = excess.div_ceil(self.step) * self.step;
                    let drop = drop.min(pending.len());
                    pending.drain(..drop);
                    self.dropped.fetch_add(drop as u64, Ordering::Relaxed);
                }
            }
            OverflowPolicy::DropNewest => {
                let room = self.limit.saturating_sub(pending.len());
                let admitted = samples.len().min(room);
                pending.extend_from_slice(&samples[..admitted]);
                self.dropped
                    .fetch_add((samples.len() - admitted) as u64, Ordering::Relaxed);
            }
        }

        let mut start = 0;
        while pending.len() - start >= self.window {
            self.outlet.push(&pending[start..start + self.window]);
            start += self.step;
        }
        if start > 0 {
            pending.drain(..start);
        }
    }
}

impl<T: Sample> Producer<T> for Windower<T> {
    fn outlet(&self) -> &Outlet<T> {
        &self.outlet
    }
}

//! Embedding transform as a stream node

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stream::{Consumer, Outlet, Producer, StreamFormat};
use crate::watermark::WatermarkEmbedder;

struct EmbedState {
    model: Box<dyn WatermarkEmbedder>,
    pending: Vec<f32>,
    out: Vec<f32>,
}

/// Feeds whole windows to the embedder and pushes what it returns
pub struct EmbedderNode {
    input: StreamFormat,
    output: StreamFormat,
    window: usize,
    state: Mutex<EmbedState>,
    outlet: Outlet<f32>,
    windows: AtomicU64,
    failures: AtomicU64,
}

impl EmbedderNode {
    pub fn new(model: Box<dyn WatermarkEmbedder>) -> Self {
        let window = model.window_frames();
        Self {
            input: StreamFormat::mono(model.input_rate()),
            output: StreamFormat::mono(model.output_rate()),
            window,
            state: Mutex::new(EmbedState {
                model,
                pending: Vec::with_capacity(window * 2),
                out: Vec::with_capacity(window * 2),
            }),
            outlet: Outlet::new(),
            windows: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn input_format(&self) -> StreamFormat {
        self.input
    }

    pub fn output_format(&self) -> StreamFormat {
        self.output
    }

    /// Windows embedded so far
    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Discard a partial window
    pub fn reset(&self) {
        self.state.lock().pending.clear();
    }
}

impl Consumer<f32> for EmbedderNode {
    fn consume(&self, samples: &[f32]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pending.extend_from_slice(samples);

        let mut start = 0;
        while state.pending.len() - start >= self.window {
            state.out.clear();
            let window = &state.pending[start..start + self.window];
            match state.model.embed(window, &mut state.out) {
                Ok(()) => {
                    self.windows.fetch_add(1, Ordering::Relaxed);
                    self.outlet.push(&state.out);
                }
                Err(e) => {
                    // The window is lost; the stream carries on
                    if self.failures.fetch_add(1, Ordering::Relaxed) == 0 {
                        tracing::warn!("Embedding failed: {}", e);
                    }
                }
            }
            start += self.window;
        }
        if start > 0 {
            state.pending.drain(..start);
        }
    }
}

impl Producer<f32> for EmbedderNode {
    fn outlet(&self) -> &Outlet<f32> {
        &self.outlet
    }
}

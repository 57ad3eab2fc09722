//! Detection transform as a stream node
//!
//! Windows are handed to a dedicated inference thread through a bounded
//! queue; when the model falls behind, new windows are dropped rather than
//! stalling the network thread. Each result is reported through a
//! [`ResultsSlot`] together with the running average since start.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::ModelError;
use crate::stream::{Consumer, StreamFormat};
use crate::watermark::WatermarkDetector;

/// Receives `(instantaneous, average)` detection probabilities
pub type ResultsCallback = Arc<dyn Fn(f32, f32) + Send + Sync>;

/// Clearable callback registration shared with the inference thread.
///
/// The callback runs with the slot locked, so once [`clear`](Self::clear)
/// returns no invocation is in flight and none will start. A callback must
/// not touch its own slot.
#[derive(Clone, Default)]
pub struct ResultsSlot {
    inner: Arc<Mutex<Option<ResultsCallback>>>,
}

impl ResultsSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: Option<ResultsCallback>) {
        *self.inner.lock() = callback;
    }

    pub fn clear(&self) {
        self.inner.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    fn notify(&self, instantaneous: f32, average: f32) {
        let slot = self.inner.lock();
        if let Some(callback) = slot.as_ref() {
            callback(instantaneous, average);
        }
    }
}

struct Worker {
    tx: Sender<Vec<f32>>,
    rx: Receiver<Vec<f32>>,
    handle: JoinHandle<()>,
}

/// Detector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub windows: u64,
    /// Windows dropped because the inference queue was full
    pub dropped: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    windows: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
}

pub struct DetectorNode {
    format: StreamFormat,
    window: usize,
    queue_depth: usize,
    model: Arc<Mutex<Box<dyn WatermarkDetector>>>,
    worker: Mutex<Option<Worker>>,
    counters: Arc<Counters>,
}

impl DetectorNode {
    pub fn new(model: Box<dyn WatermarkDetector>, queue_depth: usize) -> Self {
        Self {
            format: StreamFormat::mono(model.sample_rate()),
            window: model.window_frames(),
            queue_depth: queue_depth.max(1),
            model: Arc::new(Mutex::new(model)),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn window_frames(&self) -> usize {
        self.window
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            windows: self.counters.windows.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Start the inference thread; results go to `slot`
    pub fn start(&self, slot: ResultsSlot) -> Result<(), ModelError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (tx, rx) = bounded::<Vec<f32>>(self.queue_depth);
        let queue = rx.clone();
        let model = self.model.clone();
        let counters = self.counters.clone();
        let handle = thread::Builder::new()
            .name("watermark-detect".into())
            .spawn(move || {
                let mut count = 0u64;
                let mut sum = 0.0f64;
                while let Ok(window) = queue.recv() {
                    let result = model.lock().detect(&window);
                    match result {
                        Ok(probability) => {
                            count += 1;
                            sum += probability as f64;
                            counters.windows.fetch_add(1, Ordering::Relaxed);
                            slot.notify(probability, (sum / count as f64) as f32);
                        }
                        Err(e) => {
                            if counters.failures.fetch_add(1, Ordering::Relaxed) == 0 {
                                tracing::warn!("Detection failed: {}", e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| ModelError::Inference(format!("cannot spawn inference thread: {}", e)))?;

        *worker = Some(Worker { tx, rx, handle });
        tracing::debug!("Detector started ({} frame windows)", self.window);
        Ok(())
    }

    /// Drop queued windows and join the inference thread
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(Worker { tx, rx, handle }) = worker {
            drop(tx);
            while rx.try_recv().is_ok() {}
            let _ = handle.join();
            tracing::debug!("Detector stopped");
        }
    }
}

impl Consumer<f32> for DetectorNode {
    fn consume(&self, samples: &[f32]) {
        if samples.len() != self.window {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let worker = self.worker.lock();
        let Some(worker) = worker.as_ref() else {
            return;
        };
        match worker.tx.try_send(samples.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for DetectorNode {
    fn drop(&mut self) {
        self.stop();
    }
}

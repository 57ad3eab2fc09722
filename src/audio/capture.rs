//! Audio capture from an input device
//!
//! The input callback only copies into preallocated blocks; a dedicated
//! delivery thread pushes them to the attached consumers, so downstream
//! work (conversion, the embedding model, the network send) never runs on
//! the real-time thread.

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::DeviceId;
use crate::audio::host::{
    AudioHost, CallbackFlow, DeviceSample, DeviceStream, Direction, FaultReporter, StreamFault,
    StreamParams,
};
use crate::error::AudioError;
use crate::stream::{Outlet, Producer};

/// Delivery thread wake-up interval when no block arrives
const DELIVERY_POLL: Duration = Duration::from_millis(10);

/// Recorder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Samples copied out of the callback
    pub captured: u64,
    /// Blocks handed to consumers
    pub delivered: u64,
    /// Blocks overwritten or never stored because every block was busy
    pub dropped: u64,
}

/// Fixed set of blocks cycling between the callback and the delivery thread
struct BlockPool {
    free: ArrayQueue<Vec<DeviceSample>>,
    ready: ArrayQueue<Vec<DeviceSample>>,
    block_samples: usize,
    captured: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BlockPool {
    fn new(num_blocks: usize, block_samples: usize) -> Self {
        let free = ArrayQueue::new(num_blocks);
        for _ in 0..num_blocks {
            let _ = free.push(Vec::with_capacity(block_samples));
        }
        Self {
            free,
            ready: ArrayQueue::new(num_blocks),
            block_samples,
            captured: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Called from the input callback. Never allocates.
    fn admit(&self, data: &[DeviceSample]) {
        let chunks = data.len().div_ceil(self.block_samples);
        for (index, chunk) in data.chunks(self.block_samples).enumerate() {
            let block = match self.free.pop() {
                Some(block) => Some(block),
                None => {
                    // Delivery is behind: reuse the oldest undelivered block
                    let stolen = self.ready.pop();
                    if stolen.is_some() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    stolen
                }
            };
            let Some(mut block) = block else {
                // The only blocks are out for delivery
                self.dropped.fetch_add((chunks - index) as u64, Ordering::Relaxed);
                return;
            };
            block.clear();
            block.extend_from_slice(chunk);
            self.captured.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            if let Err(block) = self.ready.push(block) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let _ = self.free.push(block);
            }
        }
    }

    /// Deliver every queued block, oldest first, and recycle it
    fn drain(&self, outlet: &Outlet<DeviceSample>) {
        while let Some(block) = self.ready.pop() {
            outlet.push(&block);
            self.delivered.fetch_add(1, Ordering::Relaxed);
            let _ = self.free.push(block);
        }
    }

    fn discard(&self) {
        while let Some(block) = self.ready.pop() {
            let _ = self.free.push(block);
        }
    }

    fn stats(&self) -> RecorderStats {
        RecorderStats {
            captured: self.captured.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Hardware input as a stream producer
pub struct Recorder {
    host: Arc<dyn AudioHost>,
    params: StreamParams,
    faults: FaultReporter,
    outlet: Arc<Outlet<DeviceSample>>,
    pool: Arc<BlockPool>,
    running: Arc<AtomicBool>,
    stream: Mutex<Option<Box<dyn DeviceStream>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// `num_blocks` blocks of `params.block_frames` frames are preallocated
    pub fn new(
        host: Arc<dyn AudioHost>,
        params: StreamParams,
        num_blocks: usize,
        faults: FaultReporter,
    ) -> Result<Self, AudioError> {
        params.validate()?;
        if num_blocks == 0 {
            return Err(AudioError::InvalidParams("recorder needs at least one block".into()));
        }
        let pool = BlockPool::new(num_blocks, params.block_samples());
        Ok(Self {
            host,
            params,
            faults,
            outlet: Arc::new(Outlet::new()),
            pool: Arc::new(pool),
            running: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn start(&self) -> Result<(), AudioError> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.pool.discard();
        self.running.store(true, Ordering::SeqCst);

        let worker = self.spawn_worker()?;
        let waker = worker.thread().clone();

        let pool = self.pool.clone();
        let faults = self.faults.clone();
        let capture = Box::new(move |data: &[DeviceSample]| {
            if data.is_empty() {
                faults.report(StreamFault::EmptyBuffer {
                    direction: Direction::Input,
                });
                return CallbackFlow::Stop;
            }
            pool.admit(data);
            waker.unpark();
            CallbackFlow::Continue
        });

        let opened = self
            .host
            .open_input(&self.params, capture, self.faults.clone())
            .and_then(|mut stream| stream.start().map(|_| stream));

        match opened {
            Ok(stream) => {
                *slot = Some(stream);
                *self.worker.lock() = Some(worker);
                tracing::info!(
                    "Recorder started on {} ({} Hz, {} ch, {} frames)",
                    self.params.device,
                    self.params.sample_rate,
                    self.params.channels,
                    self.params.block_frames
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                worker.thread().unpark();
                let _ = worker.join();
                Err(e)
            }
        }
    }

    /// Stop the device, then deliver whatever was already captured
    pub fn stop(&self) {
        let stream = self.stream.lock().take();
        let Some(mut stream) = stream else {
            return;
        };
        stream.stop();

        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
        tracing::info!("Recorder stopped on {}", self.params.device);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.params.device
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn stats(&self) -> RecorderStats {
        self.pool.stats()
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>, AudioError> {
        let pool = self.pool.clone();
        let outlet = self.outlet.clone();
        let running = self.running.clone();
        thread::Builder::new()
            .name(format!("recorder-{}", self.params.device))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    pool.drain(&outlet);
                    thread::park_timeout(DELIVERY_POLL);
                }
                pool.drain(&outlet);
            })
            .map_err(|e| AudioError::StartFailed(e.to_string()))
    }
}

impl Producer<DeviceSample> for Recorder {
    fn outlet(&self) -> &Outlet<DeviceSample> {
        &self.outlet
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::host::testing::ManualHost;
    use crate::audio::host::PerformanceMode;
    use crate::stream::testing::Collector;
    use std::time::Instant;

    fn params(block_frames: usize) -> StreamParams {
        StreamParams {
            device: DeviceId::Default,
            sample_rate: 48000,
            channels: 1,
            performance: PerformanceMode::LowLatency,
            block_frames,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_pool_splits_into_blocks() {
        let pool = BlockPool::new(4, 4);
        let outlet = Outlet::new();
        let sink = Arc::new(Collector::new());
        outlet.attach(&sink);

        pool.admit(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        pool.drain(&outlet);

        assert_eq!(
            sink.blocks(),
            vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]
        );
        assert_eq!(pool.stats().delivered, 3);
    }

    #[test]
    fn test_pool_counts_chunks_lost_while_block_in_flight() {
        let pool = BlockPool::new(1, 4);
        pool.admit(&[1, 2, 3, 4]);
        let in_flight = pool.ready.pop().unwrap();

        pool.admit(&[5, 6, 7, 8, 9, 10]);
        let stats = pool.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.captured, 4);

        let _ = pool.free.push(in_flight);
        pool.admit(&[11, 12]);
        assert_eq!(pool.stats().dropped, 2);
        assert_eq!(pool.stats().captured, 6);
    }

    #[test]
    fn test_pool_exhaustion_drops_oldest() {
        let pool = BlockPool::new(2, 2);
        let outlet = Outlet::new();
        let sink = Arc::new(Collector::new());
        outlet.attach(&sink);

        pool.admit(&[1, 1]);
        pool.admit(&[2, 2]);
        pool.admit(&[3, 3]);
        pool.drain(&outlet);

        assert_eq!(sink.blocks(), vec![vec![2, 2], vec![3, 3]]);
        assert_eq!(pool.stats().dropped, 1);
    }

    #[test]
    fn test_recorder_delivers_off_callback() {
        let host = ManualHost::new();
        let recorder = Recorder::new(Arc::new(host.clone()), params(4), 8, FaultReporter::disabled()).unwrap();
        let sink = Arc::new(Collector::new());
        recorder.attach(&sink);

        recorder.start().unwrap();
        assert_eq!(
            host.capture(&DeviceId::Default, &[1, 2, 3, 4]),
            Some(CallbackFlow::Continue)
        );
        host.capture(&DeviceId::Default, &[5, 6]);

        wait_for(|| sink.samples().len() == 6);
        assert_eq!(sink.samples(), vec![1, 2, 3, 4, 5, 6]);
        recorder.stop();
        assert!(!recorder.is_running());
    }

    #[test]
    fn test_stop_flushes_pending_blocks() {
        let host = ManualHost::new();
        let recorder = Recorder::new(Arc::new(host.clone()), params(2), 8, FaultReporter::disabled()).unwrap();
        let sink = Arc::new(Collector::new());
        recorder.attach(&sink);

        recorder.start().unwrap();
        host.capture(&DeviceId::Default, &[7, 8, 9]);
        recorder.stop();
        assert_eq!(sink.samples(), vec![7, 8, 9]);
    }

    #[test]
    fn test_empty_capture_halts_and_reports() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let host = ManualHost::new();
        let recorder = Recorder::new(Arc::new(host.clone()), params(4), 2, FaultReporter::new(tx)).unwrap();
        recorder.start().unwrap();

        assert_eq!(host.capture(&DeviceId::Default, &[]), Some(CallbackFlow::Stop));
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamFault::EmptyBuffer {
                direction: Direction::Input
            }
        );
    }

    #[test]
    fn test_failed_start_leaves_recorder_stopped() {
        let host = ManualHost::new();
        host.fail_starts(true);
        let recorder = Recorder::new(Arc::new(host.clone()), params(4), 2, FaultReporter::disabled()).unwrap();
        assert!(recorder.start().is_err());
        assert!(!recorder.is_running());

        host.fail_starts(false);
        recorder.start().unwrap();
        assert!(recorder.is_running());
    }
}

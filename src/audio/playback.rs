//! Output-side device nodes
//!
//! [`ConsumerPlayer`] is the device sink: producers push blocks into its
//! ring and the output callback pulls fixed-size blocks out.
//! [`LoopPlayer`] plays a single buffer on repeat, starting from silence.
//!
//! Both share state with the hardware callback through a [`SpinLock`]; the
//! callback never allocates and never frees.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{RingStats, SampleRing};
use crate::audio::device::DeviceId;
use crate::audio::host::{
    AudioHost, CallbackFlow, DeviceSample, DeviceStream, Direction, FaultReporter, StreamFault,
    StreamParams,
};
use crate::error::AudioError;
use crate::stream::{Consumer, OverflowPolicy, SpinLock};

/// Ring-buffer device sink
pub struct ConsumerPlayer {
    host: Arc<dyn AudioHost>,
    params: StreamParams,
    ring: Arc<SpinLock<SampleRing<DeviceSample>>>,
    running: Arc<AtomicBool>,
    stream: Mutex<Option<Box<dyn DeviceStream>>>,
    faults: FaultReporter,
}

impl ConsumerPlayer {
    /// `buffer_samples` is the ring capacity in interleaved samples
    pub fn new(
        host: Arc<dyn AudioHost>,
        params: StreamParams,
        buffer_samples: usize,
        policy: OverflowPolicy,
        faults: FaultReporter,
    ) -> Result<Self, AudioError> {
        params.validate()?;
        if buffer_samples == 0 {
            return Err(AudioError::InvalidParams("player buffer must be non-zero".into()));
        }
        Ok(Self {
            host,
            params,
            ring: Arc::new(SpinLock::new(SampleRing::new(buffer_samples, policy))),
            running: Arc::new(AtomicBool::new(false)),
            stream: Mutex::new(None),
            faults,
        })
    }

    pub fn start(&self) -> Result<(), AudioError> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.ring.lock().clear();

        let ring = self.ring.clone();
        let faults = self.faults.clone();
        let render = Box::new(move |out: &mut [DeviceSample]| {
            if out.is_empty() {
                faults.report(StreamFault::EmptyBuffer {
                    direction: Direction::Output,
                });
                return CallbackFlow::Stop;
            }
            ring.lock().read_into(out);
            CallbackFlow::Continue
        });

        let mut stream = self.host.open_output(&self.params, render, self.faults.clone())?;
        stream.start()?;
        *slot = Some(stream);
        self.running.store(true, Ordering::Release);
        tracing::info!(
            "Player started on {} ({} Hz, {} ch)",
            self.params.device,
            self.params.sample_rate,
            self.params.channels
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().take() {
            stream.stop();
            tracing::info!("Player stopped on {}", self.params.device);
        }
        self.ring.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.params.device
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn buffered(&self) -> usize {
        self.ring.lock().available()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.lock().stats()
    }
}

impl Consumer<DeviceSample> for ConsumerPlayer {
    fn consume(&self, samples: &[DeviceSample]) {
        // Not started or shutting down: drop
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.ring.lock().write(samples);
    }
}

impl Drop for ConsumerPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopState {
    data: Arc<[DeviceSample]>,
    frames: usize,
    cursor: usize,
}

impl LoopState {
    /// Copy whole frames from the loop, wrapping at its own length
    fn fill(&mut self, out: &mut [DeviceSample], channels: usize) {
        let wanted = out.len() / channels;
        let mut written = 0;
        while written < wanted && self.frames > 0 {
            let n = (self.frames - self.cursor).min(wanted - written);
            let src = &self.data[self.cursor * channels..(self.cursor + n) * channels];
            out[written * channels..(written + n) * channels].copy_from_slice(src);
            written += n;
            self.cursor += n;
            if self.cursor == self.frames {
                self.cursor = 0;
            }
        }
        out[written * channels..].fill(0);
    }
}

/// Single-buffer loop source
pub struct LoopPlayer {
    host: Arc<dyn AudioHost>,
    params: StreamParams,
    zeros: Arc<[DeviceSample]>,
    state: Arc<SpinLock<LoopState>>,
    stream: Mutex<Option<Box<dyn DeviceStream>>>,
    faults: FaultReporter,
}

impl LoopPlayer {
    pub fn new(
        host: Arc<dyn AudioHost>,
        params: StreamParams,
        faults: FaultReporter,
    ) -> Result<Self, AudioError> {
        params.validate()?;
        let zeros: Arc<[DeviceSample]> = vec![0; params.block_samples()].into();
        let state = LoopState {
            data: zeros.clone(),
            frames: params.block_frames,
            cursor: 0,
        };
        Ok(Self {
            host,
            params,
            zeros,
            state: Arc::new(SpinLock::new(state)),
            stream: Mutex::new(None),
            faults,
        })
    }

    /// Start playing silence; call [`set_buffer`](Self::set_buffer) for content
    pub fn start(&self) -> Result<(), AudioError> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.swap(self.zeros.clone(), self.params.block_frames);

        let state = self.state.clone();
        let channels = self.params.channels as usize;
        let faults = self.faults.clone();
        let render = Box::new(move |out: &mut [DeviceSample]| {
            if out.is_empty() {
                faults.report(StreamFault::EmptyBuffer {
                    direction: Direction::Output,
                });
                return CallbackFlow::Stop;
            }
            state.lock().fill(out, channels);
            CallbackFlow::Continue
        });

        let mut stream = self.host.open_output(&self.params, render, self.faults.clone())?;
        stream.start()?;
        *slot = Some(stream);
        tracing::info!("Loop player started on {}", self.params.device);
        Ok(())
    }

    /// Replace the loop content and rewind. Takes ownership of `content`.
    pub fn set_buffer(&self, content: impl Into<Arc<[DeviceSample]>>) {
        let content = content.into();
        let frames = content.len() / self.params.channels as usize;
        if frames == 0 {
            self.clear_buffer();
            return;
        }
        self.swap(content, frames);
    }

    /// Back to silence; the device keeps running
    pub fn clear_buffer(&self) {
        self.swap(self.zeros.clone(), self.params.block_frames);
    }

    /// Stop the device and drop any content, so the next start is silent
    pub fn stop(&self) {
        if let Some(mut stream) = self.stream.lock().take() {
            stream.stop();
            tracing::info!("Loop player stopped on {}", self.params.device);
        }
        self.clear_buffer();
    }

    pub fn is_running(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.params.device
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    fn swap(&self, data: Arc<[DeviceSample]>, frames: usize) {
        let previous = {
            let mut state = self.state.lock();
            state.frames = frames;
            state.cursor = 0;
            std::mem::replace(&mut state.data, data)
        };
        // Released outside the lock so the callback never waits on a free
        drop(previous);
    }
}

impl Drop for LoopPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::host::testing::ManualHost;
    use crate::audio::host::PerformanceMode;

    fn params(block_frames: usize, channels: u16) -> StreamParams {
        StreamParams {
            device: DeviceId::Default,
            sample_rate: 48000,
            channels,
            performance: PerformanceMode::LowLatency,
            block_frames,
        }
    }

    #[test]
    fn test_consumer_player_drops_before_start() {
        let host = ManualHost::new();
        let player = ConsumerPlayer::new(
            Arc::new(host.clone()),
            params(4, 1),
            16,
            OverflowPolicy::DropOldest,
            FaultReporter::disabled(),
        )
        .unwrap();

        player.consume(&[1, 2, 3]);
        assert_eq!(player.buffered(), 0);

        player.start().unwrap();
        player.consume(&[1, 2, 3]);
        assert_eq!(host.render(&DeviceId::Default, 4), Some(vec![1, 2, 3, 0]));
    }

    #[test]
    fn test_consumer_player_end_to_end_overflow() {
        let host = ManualHost::new();
        let player = ConsumerPlayer::new(
            Arc::new(host.clone()),
            params(100, 1),
            1000,
            OverflowPolicy::DropOldest,
            FaultReporter::disabled(),
        )
        .unwrap();
        player.start().unwrap();

        let input: Vec<i16> = (0..1200).collect();
        player.consume(&input);

        let out = host.render(&DeviceId::Default, 1000).unwrap();
        assert_eq!(out, (200..1200).collect::<Vec<i16>>());
        assert_eq!(player.stats().dropped, 200);
    }

    #[test]
    fn test_consumer_player_underflow_is_silent() {
        let host = ManualHost::new();
        let player = ConsumerPlayer::new(
            Arc::new(host.clone()),
            params(100, 1),
            500,
            OverflowPolicy::DropOldest,
            FaultReporter::disabled(),
        )
        .unwrap();
        player.start().unwrap();

        let out = host.render(&DeviceId::Default, 100).unwrap();
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(player.buffered(), 0);
    }

    #[test]
    fn test_consumer_player_empty_callback_buffer_halts() {
        let host = ManualHost::new();
        let player = ConsumerPlayer::new(
            Arc::new(host.clone()),
            params(4, 1),
            16,
            OverflowPolicy::DropOldest,
            FaultReporter::disabled(),
        )
        .unwrap();
        player.start().unwrap();
        assert_eq!(host.render(&DeviceId::Default, 0), None);
    }

    #[test]
    fn test_loop_player_starts_silent() {
        let host = ManualHost::new();
        let player = LoopPlayer::new(Arc::new(host.clone()), params(4, 1), FaultReporter::disabled()).unwrap();
        player.start().unwrap();
        assert_eq!(host.render(&DeviceId::Default, 4), Some(vec![0; 4]));
    }

    #[test]
    fn test_loop_player_repeats_without_drift() {
        let host = ManualHost::new();
        let player = LoopPlayer::new(Arc::new(host.clone()), params(4, 1), FaultReporter::disabled()).unwrap();
        player.start().unwrap();
        player.set_buffer(vec![1i16, 2, 3, 4, 5]);

        assert_eq!(host.render(&DeviceId::Default, 5), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(host.render(&DeviceId::Default, 5), Some(vec![1, 2, 3, 4, 5]));
        // Pulls that straddle the loop boundary wrap at the loop length
        assert_eq!(host.render(&DeviceId::Default, 7), Some(vec![1, 2, 3, 4, 5, 1, 2]));
        assert_eq!(host.render(&DeviceId::Default, 3), Some(vec![3, 4, 5]));
    }

    #[test]
    fn test_loop_player_stereo_frames() {
        let host = ManualHost::new();
        let player = LoopPlayer::new(Arc::new(host.clone()), params(2, 2), FaultReporter::disabled()).unwrap();
        player.start().unwrap();
        player.set_buffer(vec![1i16, -1, 2, -2, 3, -3]);
        assert_eq!(
            host.render(&DeviceId::Default, 8),
            Some(vec![1, -1, 2, -2, 3, -3, 1, -1])
        );
    }

    #[test]
    fn test_loop_player_clear_and_restart_are_silent() {
        let host = ManualHost::new();
        let player = LoopPlayer::new(Arc::new(host.clone()), params(4, 1), FaultReporter::disabled()).unwrap();
        player.start().unwrap();
        player.set_buffer(vec![9i16, 9, 9]);
        player.clear_buffer();
        assert_eq!(host.render(&DeviceId::Default, 4), Some(vec![0; 4]));

        player.set_buffer(vec![5i16, 6, 7]);
        assert_eq!(host.render(&DeviceId::Default, 1), Some(vec![5]));
        player.stop();
        assert!(!player.is_running());

        player.start().unwrap();
        assert_eq!(host.render(&DeviceId::Default, 1), Some(vec![0]));
    }

    #[test]
    fn test_loop_player_empty_content_means_silence() {
        let host = ManualHost::new();
        let player = LoopPlayer::new(Arc::new(host.clone()), params(4, 1), FaultReporter::disabled()).unwrap();
        player.start().unwrap();
        player.set_buffer(Vec::<i16>::new());
        assert_eq!(host.render(&DeviceId::Default, 4), Some(vec![0; 4]));
    }
}

//! Device I/O collaborator
//!
//! The pipeline only needs to open a device at a given rate, channel count
//! and block size, start and stop it, and be called back with raw sample
//! buffers. [`CpalHost`] provides that on top of cpal; tests use the manual
//! host in [`testing`].

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{get_device_by_id, DeviceId};
use crate::error::AudioError;
use crate::stream::Sample;

/// Sample type exchanged with the hardware
pub type DeviceSample = i16;

/// Output callback: fill the whole buffer
pub type RenderFn = Box<dyn FnMut(&mut [DeviceSample]) -> CallbackFlow + Send>;

/// Input callback: one captured buffer
pub type CaptureFn = Box<dyn FnMut(&[DeviceSample]) -> CallbackFlow + Send>;

/// Returned by a callback to keep or halt its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackFlow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Latency/power trade-off requested from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    /// Let the backend pick its buffer size
    #[default]
    None,
    /// Request the configured block size exactly
    LowLatency,
    /// Request a larger buffer (four blocks)
    PowerSaving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub device: DeviceId,
    pub sample_rate: u32,
    pub channels: u16,
    pub performance: PerformanceMode,
    /// Frames per callback
    pub block_frames: usize,
}

impl StreamParams {
    pub fn validate(&self) -> Result<(), AudioError> {
        if self.sample_rate == 0 {
            return Err(AudioError::InvalidParams("sample rate must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(AudioError::InvalidParams("channel count must be non-zero".into()));
        }
        if self.block_frames == 0 {
            return Err(AudioError::InvalidParams("block size must be non-zero".into()));
        }
        Ok(())
    }

    /// Interleaved samples per callback block
    pub fn block_samples(&self) -> usize {
        self.block_frames * self.channels as usize
    }
}

/// Asynchronous fault raised by a running stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// The backend reported an error on the stream
    Device { direction: Direction, message: String },
    /// A callback was handed an empty buffer; the stream halts
    EmptyBuffer { direction: Direction },
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFault::Device { direction, message } => {
                write!(f, "{} device error: {}", direction, message)
            }
            StreamFault::EmptyBuffer { direction } => {
                write!(f, "{} callback received an empty buffer", direction)
            }
        }
    }
}

/// Non-blocking sender for [`StreamFault`]s; safe to call from a callback
#[derive(Clone, Default)]
pub struct FaultReporter {
    tx: Option<Sender<StreamFault>>,
}

impl FaultReporter {
    pub fn new(tx: Sender<StreamFault>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, fault: StreamFault) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(fault);
        }
    }
}

/// An opened device stream
pub trait DeviceStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self);
    fn device_id(&self) -> &DeviceId;
    fn is_running(&self) -> bool;
}

/// Opens device streams
pub trait AudioHost: Send + Sync {
    fn open_output(
        &self,
        params: &StreamParams,
        render: RenderFn,
        faults: FaultReporter,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;

    fn open_input(
        &self,
        params: &StreamParams,
        capture: CaptureFn,
        faults: FaultReporter,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;
}

/// cpal-backed host
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

impl AudioHost for CpalHost {
    fn open_output(
        &self,
        params: &StreamParams,
        render: RenderFn,
        faults: FaultReporter,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        params.validate()?;
        Ok(Box::new(CpalStream::new(params.clone(), Callback::Render(render), faults)))
    }

    fn open_input(
        &self,
        params: &StreamParams,
        capture: CaptureFn,
        faults: FaultReporter,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        params.validate()?;
        Ok(Box::new(CpalStream::new(params.clone(), Callback::Capture(capture), faults)))
    }
}

enum Callback {
    Render(RenderFn),
    Capture(CaptureFn),
}

impl Callback {
    fn direction(&self) -> Direction {
        match self {
            Callback::Render(_) => Direction::Output,
            Callback::Capture(_) => Direction::Input,
        }
    }
}

/// Scratch space of the f32 callbacks, in blocks; covers the power saving
/// buffer request
const SCRATCH_BLOCKS: usize = 4;

/// Halt and empty-buffer handling shared by every device callback
struct Gate {
    direction: Direction,
    halted: Arc<AtomicBool>,
    faults: FaultReporter,
}

impl Gate {
    /// Whether the callback may run on a buffer of `len` samples
    fn open(&self, len: usize) -> bool {
        if self.halted.load(Ordering::Relaxed) {
            return false;
        }
        if len == 0 {
            self.faults.report(StreamFault::EmptyBuffer { direction: self.direction });
            self.halted.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn settle(&self, flow: CallbackFlow) {
        if flow == CallbackFlow::Stop {
            self.halted.store(true, Ordering::Relaxed);
        }
    }
}

/// Render through `scratch` into a float device buffer. Allocates only when
/// the device asks for more than the scratch capacity.
fn render_f32<F>(render: &mut F, scratch: &mut Vec<DeviceSample>, data: &mut [f32]) -> CallbackFlow
where
    F: FnMut(&mut [DeviceSample]) -> CallbackFlow,
{
    scratch.clear();
    scratch.resize(data.len(), DeviceSample::SILENCE);
    let flow = render(&mut scratch[..]);
    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
        *out = sample.to_f32();
    }
    flow
}

/// Capture a float device buffer through `scratch`
fn capture_f32<F>(capture: &mut F, scratch: &mut Vec<DeviceSample>, data: &[f32]) -> CallbackFlow
where
    F: FnMut(&[DeviceSample]) -> CallbackFlow,
{
    scratch.clear();
    scratch.extend(data.iter().map(|&sample| DeviceSample::from_f32(sample)));
    capture(&scratch[..])
}

fn build_stream<E>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: cpal::SampleFormat,
    callback: Callback,
    gate: Gate,
    block_samples: usize,
    on_error: E,
) -> Result<cpal::Stream, AudioError>
where
    E: FnMut(cpal::StreamError) + Send + 'static,
{
    let built = match (callback, format) {
        (Callback::Render(mut render), cpal::SampleFormat::I16) => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                if gate.open(data.len()) {
                    gate.settle(render(data));
                } else {
                    data.fill(0);
                }
            },
            on_error,
            None,
        ),
        (Callback::Render(mut render), cpal::SampleFormat::F32) => {
            let mut scratch = Vec::with_capacity(block_samples * SCRATCH_BLOCKS);
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if gate.open(data.len()) {
                        gate.settle(render_f32(&mut render, &mut scratch, data));
                    } else {
                        data.fill(0.0);
                    }
                },
                on_error,
                None,
            )
        }
        (Callback::Capture(mut capture), cpal::SampleFormat::I16) => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if gate.open(data.len()) {
                    gate.settle(capture(data));
                }
            },
            on_error,
            None,
        ),
        (Callback::Capture(mut capture), cpal::SampleFormat::F32) => {
            let mut scratch = Vec::with_capacity(block_samples * SCRATCH_BLOCKS);
            device.build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if gate.open(data.len()) {
                        gate.settle(capture_f32(&mut capture, &mut scratch, data));
                    }
                },
                on_error,
                None,
            )
        }
        (_, other) => {
            return Err(AudioError::UnsupportedFormat(format!("device sample format {:?}", other)));
        }
    };
    built.map_err(|e| AudioError::StreamError(e.to_string()))
}

/// cpal streams are not `Send` on every platform, so each one lives on its
/// own thread for as long as it runs.
struct CpalStream {
    params: StreamParams,
    direction: Direction,
    callback: Option<Callback>,
    faults: FaultReporter,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn new(params: StreamParams, callback: Callback, faults: FaultReporter) -> Self {
        Self {
            params,
            direction: callback.direction(),
            callback: Some(callback),
            faults,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    fn stream_config(params: &StreamParams) -> StreamConfig {
        let buffer_size = match params.performance {
            PerformanceMode::None => cpal::BufferSize::Default,
            PerformanceMode::LowLatency => cpal::BufferSize::Fixed(params.block_frames as u32),
            PerformanceMode::PowerSaving => cpal::BufferSize::Fixed(params.block_frames as u32 * 4),
        };
        StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size,
        }
    }
}

impl DeviceStream for CpalStream {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let callback = self
            .callback
            .take()
            .ok_or_else(|| AudioError::StartFailed("stream was already used".into()))?;

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let params = self.params.clone();
        let faults = self.faults.clone();
        let direction = self.direction;
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("audio-{}-{}", direction, params.device))
            .spawn(move || {
                let device = match get_device_by_id(&params.device, direction) {
                    Ok(device) => device.into_inner(),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let config = CpalStream::stream_config(&params);
                let error_faults = faults.clone();
                let on_error = move |err: cpal::StreamError| {
                    error_faults.report(StreamFault::Device {
                        direction,
                        message: err.to_string(),
                    });
                };
                let gate = Gate {
                    direction,
                    halted: Arc::new(AtomicBool::new(false)),
                    faults,
                };

                let format = match direction {
                    Direction::Output => device.default_output_config(),
                    Direction::Input => device.default_input_config(),
                }
                .map(|default| default.sample_format())
                .map_err(|e| AudioError::StreamError(e.to_string()));
                let stream = format.and_then(|format| {
                    tracing::debug!("{} stream on {} uses {:?} samples", direction, params.device, format);
                    build_stream(&device, &config, format, callback, gate, params.block_samples(), on_error)
                });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StartFailed(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping the device
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let outcome = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("audio thread exited".into())));
        match outcome {
            Ok(()) => {
                self.thread_handle = Some(handle);
                tracing::debug!(
                    "Started {} stream on {} ({} Hz, {} ch, {} frames)",
                    self.direction,
                    self.params.device,
                    self.params.sample_rate,
                    self.params.channels,
                    self.params.block_frames
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn device_id(&self) -> &DeviceId {
        &self.params.device
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_params_validation() {
        let mut params = StreamParams {
            device: DeviceId::Default,
            sample_rate: 48000,
            channels: 1,
            performance: PerformanceMode::LowLatency,
            block_frames: 512,
        };
        assert!(params.validate().is_ok());
        assert_eq!(params.block_samples(), 512);

        params.channels = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_low_latency_requests_fixed_buffer() {
        let params = StreamParams {
            device: DeviceId::Default,
            sample_rate: 48000,
            channels: 2,
            performance: PerformanceMode::LowLatency,
            block_frames: 256,
        };
        let config = CpalStream::stream_config(&params);
        assert_eq!(config.buffer_size, cpal::BufferSize::Fixed(256));
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn test_float_render_converts_through_scratch() {
        let mut render = |block: &mut [DeviceSample]| {
            block.copy_from_slice(&[16384, -32768, 0]);
            CallbackFlow::Continue
        };
        let mut scratch = Vec::with_capacity(3);
        let capacity = scratch.capacity();
        let mut data = [1.0f32; 3];
        assert_eq!(render_f32(&mut render, &mut scratch, &mut data), CallbackFlow::Continue);
        assert_eq!(data, [0.5, -1.0, 0.0]);
        assert_eq!(scratch.capacity(), capacity);
    }

    #[test]
    fn test_float_capture_saturates() {
        let mut seen = Vec::new();
        let mut capture = |block: &[DeviceSample]| {
            seen.extend_from_slice(block);
            CallbackFlow::Stop
        };
        let mut scratch = Vec::with_capacity(4);
        let flow = capture_f32(&mut capture, &mut scratch, &[0.5, -1.0, 2.0, -2.0]);
        assert_eq!(flow, CallbackFlow::Stop);
        assert_eq!(seen, vec![16384, -32768, 32767, -32768]);
    }

    #[test]
    fn test_gate_halts_on_empty_buffer_and_stop() {
        let (tx, rx) = bounded(4);
        let gate = Gate {
            direction: Direction::Output,
            halted: Arc::new(AtomicBool::new(false)),
            faults: FaultReporter::new(tx),
        };
        assert!(gate.open(8));
        gate.settle(CallbackFlow::Continue);
        assert!(gate.open(8));

        assert!(!gate.open(0));
        assert_eq!(rx.try_recv(), Ok(StreamFault::EmptyBuffer { direction: Direction::Output }));
        assert!(!gate.open(8));

        let gate = Gate {
            direction: Direction::Input,
            halted: Arc::new(AtomicBool::new(false)),
            faults: FaultReporter::disabled(),
        };
        gate.settle(CallbackFlow::Stop);
        assert!(!gate.open(8));
    }

    #[test]
    fn test_fault_reporter_never_blocks() {
        let (tx, rx) = bounded(1);
        let reporter = FaultReporter::new(tx);
        reporter.report(StreamFault::EmptyBuffer { direction: Direction::Output });
        // Channel full: dropped silently
        reporter.report(StreamFault::EmptyBuffer { direction: Direction::Input });
        assert_eq!(rx.len(), 1);

        FaultReporter::disabled().report(StreamFault::EmptyBuffer { direction: Direction::Input });
    }
}

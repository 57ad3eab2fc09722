//! Outbound call orchestrator
//!
//! ```text
//! recorder -> converter_in -> embedder -> converter_out -> transport sender
//! loop player (probe tone)
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::capture::{Recorder, RecorderStats};
use crate::audio::device::DeviceId;
use crate::audio::host::{AudioHost, DeviceSample, StreamFault};
use crate::audio::playback::LoopPlayer;
use crate::audio::probe::build_probe;
use crate::config::AppConfig;
use crate::error::{AudioError, Result};
use crate::network::sender::{SenderStats, TransportSender};
use crate::session::{FaultChannel, Transition, TransitionGuard};
use crate::stream::{FormatConverter, Producer};
use crate::watermark::{EmbedderNode, WatermarkEmbedder};

/// Snapshot of a call's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub sender: Option<SenderStats>,
    pub recorder: Option<RecorderStats>,
    pub embedded_windows: u64,
}

#[derive(Default)]
struct CallState {
    player: Option<Arc<LoopPlayer>>,
    recorder: Option<Arc<Recorder>>,
    probe: Option<Arc<[DeviceSample]>>,
    sender: Option<Arc<TransportSender>>,
}

pub struct Caller {
    config: AppConfig,
    host: Arc<dyn AudioHost>,
    guard: TransitionGuard,
    running: AtomicBool,
    state: Mutex<CallState>,
    converter_in: Arc<FormatConverter<DeviceSample, f32>>,
    embedder: Arc<EmbedderNode>,
    converter_out: Arc<FormatConverter<f32, DeviceSample>>,
    faults: FaultChannel,
}

impl Caller {
    pub fn new(
        config: AppConfig,
        host: Arc<dyn AudioHost>,
        embedder: Box<dyn WatermarkEmbedder>,
    ) -> Result<Self> {
        config.validate()?;
        let embedder = EmbedderNode::new(embedder);
        let converter_in = FormatConverter::new(config.audio.format(), embedder.input_format())?;
        let converter_out = FormatConverter::new(
            embedder.output_format(),
            config.watermark.transport_format(),
        )?;
        Ok(Self {
            config,
            host,
            guard: TransitionGuard::new(),
            running: AtomicBool::new(false),
            state: Mutex::new(CallState::default()),
            converter_in: Arc::new(converter_in),
            embedder: Arc::new(embedder),
            converter_out: Arc::new(converter_out),
            faults: FaultChannel::new(),
        })
    }

    /// Connect to the callee at `remote` and start streaming.
    ///
    /// Devices are reopened only when the requested ids differ from the
    /// ones already open; the probe is generated when the loop player is
    /// opened, not per call.
    pub fn start_call(
        &self,
        remote: &str,
        playback: &DeviceId,
        record: &DeviceId,
    ) -> Result<Transition> {
        let Some(_ticket) = self.guard.try_enter() else {
            tracing::debug!("start_call ignored: transition in flight");
            return Ok(Transition::Busy);
        };
        if self.running.load(Ordering::Acquire) {
            return Ok(Transition::Unchanged);
        }

        let sender = Arc::new(TransportSender::connect(remote, &self.config.network)?);

        let mut state = self.state.lock();
        let (player, recorder) = self.open_devices(&mut state, playback, record)?;

        recorder.attach(&self.converter_in);
        self.converter_in.attach(&self.embedder);
        self.embedder.attach(&self.converter_out);
        self.converter_out.attach(&sender);
        state.sender = Some(sender);

        if let Err(e) = start_devices(&player, &recorder, state.probe.clone()) {
            tracing::error!("Call start failed: {}", e);
            self.teardown(&mut state);
            return Err(e.into());
        }

        self.running.store(true, Ordering::Release);
        tracing::info!("Call started to {} (playback {}, record {})", remote, playback, record);
        Ok(Transition::Applied)
    }

    pub fn stop_call(&self) -> Transition {
        let Some(_ticket) = self.guard.try_enter() else {
            tracing::debug!("stop_call ignored: transition in flight");
            return Transition::Busy;
        };
        if !self.running.load(Ordering::Acquire) {
            return Transition::Unchanged;
        }

        let mut state = self.state.lock();
        self.teardown(&mut state);
        self.running.store(false, Ordering::Release);
        tracing::info!("Call stopped");
        Transition::Applied
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Device faults reported since the last call
    pub fn faults(&self) -> Vec<StreamFault> {
        self.faults.drain()
    }

    pub fn stats(&self) -> CallStats {
        let state = self.state.lock();
        CallStats {
            sender: state.sender.as_ref().map(|s| s.stats()),
            recorder: state.recorder.as_ref().map(|r| r.stats()),
            embedded_windows: self.embedder.windows(),
        }
    }

    fn open_devices(
        &self,
        state: &mut CallState,
        playback: &DeviceId,
        record: &DeviceId,
    ) -> Result<(Arc<LoopPlayer>, Arc<Recorder>)> {
        let audio = &self.config.audio;
        let reused = state.player.as_ref().filter(|p| p.device_id() == playback).cloned();
        let player = match reused {
            Some(player) => player,
            None => {
                let player = Arc::new(LoopPlayer::new(
                    self.host.clone(),
                    audio.loop_params(playback),
                    self.faults.reporter(),
                )?);
                state.probe = build_probe(&self.config.probe, audio.format())?;
                state.player = Some(player.clone());
                tracing::debug!("Opened loop player on {}", playback);
                player
            }
        };
        let reused = state.recorder.as_ref().filter(|r| r.device_id() == record).cloned();
        let recorder = match reused {
            Some(recorder) => recorder,
            None => {
                let recorder = Arc::new(Recorder::new(
                    self.host.clone(),
                    audio.recorder_params(record),
                    audio.recorder_blocks,
                    self.faults.reporter(),
                )?);
                state.recorder = Some(recorder.clone());
                tracing::debug!("Opened recorder on {}", record);
                recorder
            }
        };
        Ok((player, recorder))
    }

    /// Stop devices, unwire the chain and close the session
    fn teardown(&self, state: &mut CallState) {
        if let Some(recorder) = &state.recorder {
            recorder.stop();
            recorder.detach_all();
        }
        if let Some(player) = &state.player {
            player.stop();
        }
        self.converter_out.detach_all();
        self.embedder.detach_all();
        self.converter_in.detach_all();
        state.sender = None;

        self.converter_in.reset();
        self.embedder.reset();
        self.converter_out.reset();
    }
}

/// Loop player first so the probe is audible before capture begins
fn start_devices(
    player: &LoopPlayer,
    recorder: &Recorder,
    probe: Option<Arc<[DeviceSample]>>,
) -> std::result::Result<(), AudioError> {
    player.start()?;
    if let Some(probe) = probe {
        player.set_buffer(probe);
    }
    recorder.start()
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.stop_call();
    }
}

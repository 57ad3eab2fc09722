//! Inbound call orchestrator
//!
//! ```text
//!                    +-> playback_adapter -> player
//! transport receiver |
//!                    +-> windower -> converter -> detector -> results callback
//! ```

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::buffer::RingStats;
use crate::audio::device::DeviceId;
use crate::audio::host::{AudioHost, DeviceSample, StreamFault};
use crate::audio::playback::ConsumerPlayer;
use crate::config::AppConfig;
use crate::error::{ConfigError, Result};
use crate::network::receiver::{ReceiverStats, TransportReceiver};
use crate::session::{FaultChannel, Transition, TransitionGuard};
use crate::stream::{FormatConverter, Producer, Windower};
use crate::watermark::detect::DetectorStats;
use crate::watermark::{DetectorNode, ResultsCallback, ResultsSlot, WatermarkDetector};

/// Snapshot of the server's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalleeStats {
    pub receiver: Option<ReceiverStats>,
    pub player: Option<RingStats>,
    pub detector: DetectorStats,
    /// Received samples discarded before reaching a detection window
    pub window_dropped: u64,
}

#[derive(Default)]
struct ServerState {
    player: Option<Arc<ConsumerPlayer>>,
    receiver: Option<Arc<TransportReceiver>>,
}

pub struct Callee {
    config: AppConfig,
    host: Arc<dyn AudioHost>,
    guard: TransitionGuard,
    running: AtomicBool,
    state: Mutex<ServerState>,
    playback_adapter: Arc<FormatConverter<DeviceSample, DeviceSample>>,
    windower: Arc<Windower<DeviceSample>>,
    converter: Arc<FormatConverter<DeviceSample, f32>>,
    detector: Arc<DetectorNode>,
    callback: Mutex<Option<ResultsCallback>>,
    slot: ResultsSlot,
    faults: FaultChannel,
}

impl Callee {
    pub fn new(
        config: AppConfig,
        host: Arc<dyn AudioHost>,
        detector: Box<dyn WatermarkDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let transport = config.watermark.transport_format();
        if detector.sample_rate() != transport.sample_rate {
            return Err(ConfigError::Invalid {
                field: "watermark.transport_rate",
                reason: format!(
                    "detector runs at {} Hz, transport carries {} Hz",
                    detector.sample_rate(),
                    transport.sample_rate
                ),
            }
            .into());
        }

        let detector = DetectorNode::new(detector, config.watermark.detection_queue_depth);
        let window_frames = detector.window_frames();
        let mut window = config.watermark.window(config.audio.overflow_policy);
        window.window_frames = window_frames;
        window.step_frames = window.step_frames.min(window_frames);
        let windower = Windower::new(transport, window)?;
        let playback_adapter = FormatConverter::new(transport, config.audio.format())?;

        Ok(Self {
            config,
            host,
            guard: TransitionGuard::new(),
            running: AtomicBool::new(false),
            state: Mutex::new(ServerState::default()),
            playback_adapter: Arc::new(playback_adapter),
            windower: Arc::new(windower),
            converter: Arc::new(FormatConverter::same_format(transport)),
            detector: Arc::new(detector),
            callback: Mutex::new(None),
            slot: ResultsSlot::new(),
            faults: FaultChannel::new(),
        })
    }

    /// Listen for a caller and play what it sends on `playback`
    pub fn start_server(&self, playback: &DeviceId) -> Result<Transition> {
        let Some(_ticket) = self.guard.try_enter() else {
            tracing::debug!("start_server ignored: transition in flight");
            return Ok(Transition::Busy);
        };
        if self.running.load(Ordering::Acquire) {
            return Ok(Transition::Unchanged);
        }

        let receiver = Arc::new(TransportReceiver::bind(&self.config.network)?);

        let mut state = self.state.lock();
        let player = self.open_player(&mut state, playback)?;
        if let Err(e) = player.start() {
            tracing::error!("Server start failed: {}", e);
            return Err(e.into());
        }

        receiver.attach(&self.playback_adapter);
        self.playback_adapter.attach(&player);
        receiver.attach(&self.windower);
        self.windower.attach(&self.converter);
        self.converter.attach(&self.detector);
        state.receiver = Some(receiver.clone());
        drop(state);

        let started = self
            .detector
            .start(self.slot.clone())
            .map_err(crate::Error::from)
            .and_then(|_| receiver.start().map_err(crate::Error::from));
        if let Err(e) = started {
            tracing::error!("Server start failed: {}", e);
            self.teardown();
            return Err(e);
        }

        {
            let registered = self.callback.lock();
            self.slot.set(registered.clone());
            self.running.store(true, Ordering::Release);
        }
        tracing::info!("Server listening on {} (playback {})", receiver.local_addr(), playback);
        Ok(Transition::Applied)
    }

    /// Stop listening. No results callback runs once this returns.
    pub fn stop(&self) -> Transition {
        let Some(_ticket) = self.guard.try_enter() else {
            tracing::debug!("stop ignored: transition in flight");
            return Transition::Busy;
        };
        if !self.running.load(Ordering::Acquire) {
            return Transition::Unchanged;
        }

        self.teardown();
        tracing::info!("Server stopped");
        Transition::Applied
    }

    /// Register the detection callback, replacing any previous one. It
    /// survives stop and start, and fires on the inference thread with
    /// `(instantaneous, average)` probabilities.
    ///
    /// The callback may query the callee (`stats`, `faults`, `is_running`)
    /// but must not stop it or change the registration.
    pub fn set_on_results_callback<F>(&self, callback: F)
    where
        F: Fn(f32, f32) + Send + Sync + 'static,
    {
        let callback: ResultsCallback = Arc::new(callback);
        let mut registered = self.callback.lock();
        *registered = Some(callback.clone());
        if self.running.load(Ordering::Acquire) {
            self.slot.set(Some(callback));
        }
    }

    pub fn clear_results_callback(&self) {
        let mut registered = self.callback.lock();
        registered.take();
        self.slot.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the server is listening on while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().receiver.as_ref().map(|r| r.local_addr())
    }

    /// Device faults reported since the last call
    pub fn faults(&self) -> Vec<StreamFault> {
        self.faults.drain()
    }

    pub fn stats(&self) -> CalleeStats {
        let state = self.state.lock();
        CalleeStats {
            receiver: state.receiver.as_ref().map(|r| r.stats()),
            player: state.player.as_ref().map(|p| p.stats()),
            detector: self.detector.stats(),
            window_dropped: self.windower.dropped_samples(),
        }
    }

    fn open_player(&self, state: &mut ServerState, playback: &DeviceId) -> Result<Arc<ConsumerPlayer>> {
        let reused = state.player.as_ref().filter(|p| p.device_id() == playback).cloned();
        if let Some(player) = reused {
            return Ok(player);
        }
        let audio = &self.config.audio;
        let player = Arc::new(ConsumerPlayer::new(
            self.host.clone(),
            audio.player_params(playback),
            audio.player_buffer_samples(),
            audio.overflow_policy,
            self.faults.reporter(),
        )?);
        state.player = Some(player.clone());
        tracing::debug!("Opened player on {}", playback);
        Ok(player)
    }

    /// Results are silenced before `state` is taken: the slot stays locked
    /// while a callback runs, and a callback may read `state` through
    /// `stats`.
    fn teardown(&self) {
        {
            let _registered = self.callback.lock();
            self.running.store(false, Ordering::Release);
            self.slot.clear();
        }
        self.detector.stop();

        let mut state = self.state.lock();
        if let Some(receiver) = state.receiver.take() {
            receiver.stop();
            receiver.detach_all();
        }
        if let Some(player) = &state.player {
            player.stop();
        }
        self.playback_adapter.detach_all();
        self.windower.detach_all();
        self.converter.detach_all();

        self.playback_adapter.reset();
        self.windower.reset();
        self.converter.reset();
    }
}

impl Drop for Callee {
    fn drop(&mut self) {
        self.stop();
    }
}

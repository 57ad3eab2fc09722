//! # Watermark Link
//!
//! Real-time audio pipeline that carries watermarked speech from a caller
//! to a callee over UDP and reports how confidently the callee detects the
//! watermark.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               CALLER                                  │
//! │  ┌──────────────┐                              ┌──────────────────┐  │
//! │  │  LoopPlayer  │  probe tone on repeat        │    Microphone    │  │
//! │  └──────────────┘                              └────────┬─────────┘  │
//! │                                                         ▼            │
//! │                                                ┌──────────────────┐  │
//! │                                                │ Recorder (pool)  │  │
//! │                                                └────────┬─────────┘  │
//! │                                                         ▼            │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ Transport    │◀──│ Converter    │◀──│ Converter -> Embedder    │  │
//! │  │ Sender (UDP) │   │ (-> 16 kHz)  │   │ (device -> model rate)   │  │
//! │  └──────┬───────┘   └──────────────┘   └──────────────────────────┘  │
//! └─────────┼────────────────────────────────────────────────────────────┘
//!           │ Hello / Welcome / Audio[session|seq|samples] / Bye
//!           ▼
//! ┌─────────┼────────────────────────────────────────────────────────────┐
//! │  ┌──────┴───────┐                               CALLEE               │
//! │  │ Transport    │──────────────┬──────────────────────┐              │
//! │  │ Receiver     │              ▼                      ▼              │
//! │  └──────────────┘     ┌─────────────────┐    ┌─────────────────┐     │
//! │                       │ Playback adapter│    │    Windower     │     │
//! │                       └────────┬────────┘    └────────┬────────┘     │
//! │                                ▼                      ▼              │
//! │                       ┌─────────────────┐    ┌─────────────────┐     │
//! │                       │ ConsumerPlayer  │    │ Converter -> f32│     │
//! │                       │ (ring buffer)   │    └────────┬────────┘     │
//! │                       └─────────────────┘             ▼              │
//! │                                              ┌─────────────────┐     │
//! │                                              │ Detector thread │──▶ results
//! │                                              └─────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod stream;
pub mod watermark;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default device sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default device channel count
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Frames per output callback of the ring-buffer player
    pub const PLAYER_CALLBACK_FRAMES: usize = 512;

    /// Player ring capacity, in callback blocks
    pub const PLAYER_BUFFER_BLOCKS: usize = 64;

    /// Frames per recorder block (20 ms at 48 kHz)
    pub const RECORDER_BLOCK_FRAMES: usize = 960;

    /// Preallocated recorder blocks
    pub const RECORDER_BLOCKS: usize = 16;

    /// Default UDP port of the callee
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Smallest accepted packet size setting
    pub const MIN_PACKET_SIZE: usize = 128;

    /// How long the caller waits for a `Welcome`
    pub const CONNECT_TIMEOUT_MS: u64 = 2000;

    /// Interval between handshake attempts
    pub const HANDSHAKE_RETRY_MS: u64 = 200;

    /// Receive timeout of the callee socket, bounds shutdown latency
    pub const RECEIVE_POLL_MS: u64 = 50;

    /// Rate of the audio carried between caller and callee
    pub const TRANSPORT_SAMPLE_RATE: u32 = 16000;

    /// Frames per watermark model window (100 ms at 16 kHz)
    pub const MODEL_WINDOW_FRAMES: usize = 1600;

    /// Retained input of the windower, in steps
    pub const MAX_RETAINED_WINDOW_BLOCKS: usize = 16;

    /// Windows queued for the inference thread
    pub const DETECTION_QUEUE_DEPTH: usize = 8;

    /// Device faults buffered until drained
    pub const FAULT_QUEUE_DEPTH: usize = 32;

    /// Probe tone frequencies
    pub const PROBE_TONES_HZ: [f32; 6] = [16000.0, 16300.0, 16600.0, 16900.0, 17200.0, 17500.0];

    /// Peak amplitude of the summed probe
    pub const PROBE_AMPLITUDE: f32 = 0.8;

    /// Probe length
    pub const PROBE_DURATION_SECS: f32 = 20.0;
}

//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod host;
pub mod playback;
pub mod probe;

pub use buffer::{RingStats, SampleRing};
pub use capture::{Recorder, RecorderStats};
pub use device::{get_device_by_id, list_devices, AudioDevice, AudioDeviceInfo, DeviceId};
pub use host::{
    AudioHost, CallbackFlow, CpalHost, DeviceSample, DeviceStream, Direction, FaultReporter,
    PerformanceMode, StreamFault, StreamParams,
};
pub use playback::{ConsumerPlayer, LoopPlayer};

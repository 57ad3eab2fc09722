//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::audio::host::Direction;
use crate::error::AudioError;

/// Which device a stream should open.
///
/// Serialized as a plain string: `"default"` (or empty) selects the
/// system default, anything else is matched against device names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceId {
    #[default]
    Default,
    Named(String),
}

impl DeviceId {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("default") {
            DeviceId::Default
        } else {
            DeviceId::Named(value.to_string())
        }
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        DeviceId::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Default => write!(f, "default"),
            DeviceId::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Summary of a device for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub direction: Direction,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, direction: Direction) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            direction,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, Direction::Input);
                devices.push(AudioDeviceInfo {
                    id: name.clone(),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);

                // Duplex devices are listed once
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }

                let (sample_rates, channels) = get_device_capabilities(&device, Direction::Output);
                devices.push(AudioDeviceInfo {
                    id: name.clone(),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn get_device_capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Input => device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
        Direction::Output => device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default(),
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate_val in [16000u32, 22050, 44100, 48000, 88200, 96000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Resolve a device for the given direction
pub fn get_device_by_id(id: &DeviceId, direction: Direction) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let name = match id {
        DeviceId::Default => {
            let device = match direction {
                Direction::Input => host.default_input_device(),
                Direction::Output => host.default_output_device(),
            };
            return device
                .map(|d| AudioDevice::from_cpal(d, direction))
                .ok_or_else(|| AudioError::DeviceNotFound(format!("no default {} device", direction)));
        }
        DeviceId::Named(name) => name,
    };

    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::CpalError(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| &n == name).unwrap_or(false) {
            return Ok(AudioDevice::from_cpal(device, direction));
        }
    }

    Err(AudioError::DeviceNotFound(format!("{}:{}", direction, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parse() {
        assert_eq!(DeviceId::parse(""), DeviceId::Default);
        assert_eq!(DeviceId::parse("Default"), DeviceId::Default);
        assert_eq!(
            DeviceId::parse(" USB Audio "),
            DeviceId::Named("USB Audio".to_string())
        );
    }

    #[test]
    fn test_device_id_serializes_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            device: DeviceId,
        }
        let text = toml::to_string(&Wrapper {
            device: DeviceId::Named("Speakers".into()),
        })
        .unwrap();
        assert_eq!(text.trim(), "device = \"Speakers\"");

        let back: Wrapper = toml::from_str("device = \"default\"").unwrap();
        assert_eq!(back.device, DeviceId::Default);
    }
}

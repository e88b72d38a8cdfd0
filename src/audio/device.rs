//! Input device enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Description of a capture-capable device
#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub name: String,
    /// Channels of the default input configuration
    pub channels: u16,
    /// Sample rate of the default input configuration, in Hz
    pub default_sample_rate: u32,
    /// Whether this is the host's default input
    pub is_default: bool,
}

/// List all available input devices
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Failed to enumerate input devices: {}", e);
            return Vec::new();
        }
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some(InputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                channels: config.channels(),
                default_sample_rate: config.sample_rate().0,
            })
        })
        .collect()
}

/// Find an input device by exact name, or the default input device
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()));
    };

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

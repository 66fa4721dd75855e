//! Input device enumeration and selection.

use serde::{Deserialize, Serialize};

#[cfg(feature = "audio-cpal")]
use crate::error::{Result, VoiceError};

/// What a device name suggests it captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Microphone,
    /// Captures system output rather than a voice.
    Loopback,
    Unknown,
}

/// An input device as presented to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub kind: DeviceKind,
    /// Best candidate for an interview microphone.
    pub is_recommended: bool,
}

const LOOPBACK_MARKERS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "virtual output",
    "mezcla estéreo",
    "mezcla estereo",
    "mixage stéréo",
    "speakers (",
];

const MIC_MARKERS: &[&str] = &[
    "microphone",
    "micrófono",
    "mic",
    "headset",
    "array",
    "usb",
    "webcam",
    "airpods",
];

/// Guess what a device captures from its name.
pub fn classify_device_name(name: &str) -> DeviceKind {
    let lowered = name.trim().to_lowercase();
    if LOOPBACK_MARKERS.iter().any(|m| lowered.contains(m)) {
        DeviceKind::Loopback
    } else if MIC_MARKERS.iter().any(|m| lowered.contains(m)) {
        DeviceKind::Microphone
    } else {
        DeviceKind::Unknown
    }
}

fn rank(device: &InputDeviceInfo) -> i32 {
    let kind = match device.kind {
        DeviceKind::Microphone => 10,
        DeviceKind::Unknown => 4,
        DeviceKind::Loopback => -20,
    };
    kind + if device.is_default { 3 } else { 0 }
}

/// Flag the best microphone and order the list best-first.
pub fn rank_devices(mut devices: Vec<InputDeviceInfo>) -> Vec<InputDeviceInfo> {
    if let Some(best) = devices
        .iter()
        .enumerate()
        .filter(|(_, d)| d.kind != DeviceKind::Loopback)
        .max_by_key(|(_, d)| rank(d))
        .map(|(idx, _)| idx)
    {
        devices[best].is_recommended = true;
    }
    devices.sort_by_key(|d| (!d.is_recommended, -rank(d), d.name.to_lowercase()));
    devices
}

/// List available input devices, best microphone first.
///
/// Returns an empty `Vec` when enumeration fails or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let names: Vec<String> = match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, d)| d.name().unwrap_or_else(|_| format!("Input {}", idx + 1)))
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_name.iter().cloned().collect()
        }
    };

    rank_devices(
        names
            .into_iter()
            .map(|name| InputDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                kind: classify_device_name(&name),
                name,
                is_recommended: false,
            })
            .collect(),
    )
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    vec![]
}

/// Find the input device to open: the preferred name if present, then the
/// system default, then the first device that does not look like loopback.
#[cfg(feature = "audio-cpal")]
pub fn resolve_input_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    if let Some(wanted) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|d| d.name().is_ok_and(|n| n == wanted)) {
                    return Ok(device);
                }
                warn!(device = wanted, "preferred input device not found, falling back");
            }
            Err(e) => warn!("failed to list input devices: {e}"),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    let devices = host
        .input_devices()
        .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;
    let mut fallback = None;
    for device in devices {
        let name = device.name().unwrap_or_default();
        if classify_device_name(&name) != DeviceKind::Loopback {
            warn!(device = name.as_str(), "no default input device, using first microphone");
            return Ok(device);
        }
        fallback.get_or_insert(device);
    }
    fallback.ok_or(VoiceError::NoInputDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, is_default: bool) -> InputDeviceInfo {
        InputDeviceInfo {
            name: name.into(),
            is_default,
            kind: classify_device_name(name),
            is_recommended: false,
        }
    }

    #[test]
    fn classifies_common_names() {
        assert_eq!(classify_device_name("Stereo Mix (Realtek Audio)"), DeviceKind::Loopback);
        assert_eq!(classify_device_name("Monitor of Built-in Audio"), DeviceKind::Loopback);
        assert_eq!(
            classify_device_name("Microphone Array (Intel SST)"),
            DeviceKind::Microphone
        );
        assert_eq!(classify_device_name("Micrófono (USB)"), DeviceKind::Microphone);
        assert_eq!(classify_device_name("Built-in Input"), DeviceKind::Unknown);
    }

    #[test]
    fn recommends_a_microphone_over_a_default_loopback() {
        let ranked = rank_devices(vec![
            info("Stereo Mix (Realtek Audio)", true),
            info("Built-in Input", false),
            info("USB Headset Mic", false),
        ]);
        assert_eq!(ranked[0].name, "USB Headset Mic");
        assert!(ranked[0].is_recommended);
        assert_eq!(ranked.iter().filter(|d| d.is_recommended).count(), 1);
        assert_eq!(ranked.last().map(|d| d.kind), Some(DeviceKind::Loopback));
    }

    #[test]
    fn only_loopback_devices_get_no_recommendation() {
        let ranked = rank_devices(vec![info("Stereo Mix", true)]);
        assert!(!ranked[0].is_recommended);
    }
}

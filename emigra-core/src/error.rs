use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::PlatformProfile;

/// All errors produced by emigra-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no audio input device found")]
    NoInputDevice,

    #[error("no audio output device found")]
    NoOutputDevice,

    #[error("audio device busy: {0}")]
    DeviceBusy(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no API credential configured")]
    CredentialMissing,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid transport text: {0}")]
    InvalidTransportText(#[from] base64::DecodeError),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("chat request failed: {0}")]
    Chat(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VoiceError>;

impl VoiceError {
    /// Map this error onto the user-facing message category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            VoiceError::PermissionDenied(_) => ErrorCategory::PermissionDenied,
            VoiceError::NoInputDevice => ErrorCategory::DeviceNotFound,
            VoiceError::DeviceBusy(_) => ErrorCategory::DeviceBusy,
            VoiceError::CredentialMissing => ErrorCategory::CredentialMissing,
            VoiceError::Transport(_) | VoiceError::Protocol(_) => ErrorCategory::TransportFailure,
            _ => ErrorCategory::Other,
        }
    }
}

/// Message category shown to the user when a session ends in `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    CredentialMissing,
    TransportFailure,
    /// Anything that does not fit the categories above.
    Other,
}

impl ErrorCategory {
    /// Short message for the category.
    pub fn message(self, platform: &PlatformProfile) -> &'static str {
        match self {
            ErrorCategory::PermissionDenied if platform.is_ios => {
                "Please allow microphone access in Settings > Safari > Microphone."
            }
            ErrorCategory::PermissionDenied => {
                "Microphone permission denied. Allow microphone access in your system settings."
            }
            ErrorCategory::DeviceNotFound => {
                "No microphone was found. Check that your device has an enabled microphone."
            }
            ErrorCategory::DeviceBusy => {
                "The microphone is being used by another application. Close it and try again."
            }
            ErrorCategory::CredentialMissing => "Configuration error: API key not found.",
            ErrorCategory::TransportFailure | ErrorCategory::Other if platform.is_mobile => {
                "Could not start the voice assistant. Try reloading or use text mode."
            }
            ErrorCategory::TransportFailure | ErrorCategory::Other => {
                "Could not connect to the voice assistant. Check your microphone and connection."
            }
        }
    }

    /// Extra advice shown on constrained (mobile) devices.
    pub fn hint(self, platform: &PlatformProfile) -> Option<&'static str> {
        match (platform.is_mobile, platform.is_ios) {
            (true, true) => Some(
                "Make sure no other app is using the microphone. \
                 On iOS, reload after granting permission.",
            ),
            (true, false) => Some("Make sure no other app is using the microphone."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_expected_categories() {
        assert_eq!(
            VoiceError::PermissionDenied("denied".into()).category(),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(VoiceError::NoInputDevice.category(), ErrorCategory::DeviceNotFound);
        assert_eq!(
            VoiceError::DeviceBusy("in use".into()).category(),
            ErrorCategory::DeviceBusy
        );
        assert_eq!(
            VoiceError::CredentialMissing.category(),
            ErrorCategory::CredentialMissing
        );
        assert_eq!(
            VoiceError::Transport("reset".into()).category(),
            ErrorCategory::TransportFailure
        );
        assert_eq!(
            VoiceError::AudioStream("boom".into()).category(),
            ErrorCategory::Other
        );
    }

    #[test]
    fn hint_only_on_mobile() {
        let desktop = PlatformProfile::default();
        let android = PlatformProfile {
            is_mobile: true,
            is_ios: false,
        };
        let ios = PlatformProfile {
            is_mobile: true,
            is_ios: true,
        };

        assert!(ErrorCategory::DeviceBusy.hint(&desktop).is_none());
        assert!(ErrorCategory::DeviceBusy.hint(&android).is_some());
        assert!(ErrorCategory::PermissionDenied
            .hint(&ios)
            .is_some_and(|h| h.contains("reload")));
    }

    #[test]
    fn ios_permission_message_points_at_settings() {
        let ios = PlatformProfile {
            is_mobile: true,
            is_ios: true,
        };
        assert!(ErrorCategory::PermissionDenied.message(&ios).contains("Settings"));
    }
}

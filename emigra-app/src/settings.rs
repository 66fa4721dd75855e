//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use emigra_core::{
    chat::{ChatConfig, DEFAULT_CHAT_MODEL},
    engine::{DEFAULT_MODEL, DEFAULT_VOICE},
    EngineConfig, Language, PlatformProfile,
};
use serde::{Deserialize, Serialize};

/// Environment variables checked for the service key, in priority order.
/// Any of them overrides the stored key.
pub const API_KEY_VARS: [&str; 3] = ["EMIGRA_API_KEY", "GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub language: String,
    pub voice: String,
    pub model: String,
    pub chat_model: String,
    pub preferred_input_device: Option<String>,
    /// `auto`, `desktop`, `android` or `ios`.
    pub platform: String,
    pub volume_gain: f32,
    pub api_key: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            language: "es".into(),
            voice: DEFAULT_VOICE.into(),
            model: DEFAULT_MODEL.into(),
            chat_model: DEFAULT_CHAT_MODEL.into(),
            preferred_input_device: None,
            platform: "auto".into(),
            volume_gain: emigra_core::codec::VOLUME_GAIN,
            api_key: None,
        }
    }
}

/// Settings as shown to the user; the key itself never leaves the file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub language: String,
    pub voice: String,
    pub model: String,
    pub chat_model: String,
    pub preferred_input_device: Option<String>,
    pub platform: String,
    pub volume_gain: f32,
    pub has_api_key: bool,
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.language = Language::from_code(&self.language).code.to_string();
        self.voice = non_empty_or(&self.voice, DEFAULT_VOICE);
        self.model = non_empty_or(&self.model, DEFAULT_MODEL);
        self.chat_model = non_empty_or(&self.chat_model, DEFAULT_CHAT_MODEL);
        self.platform = normalize_platform(&self.platform);
        self.volume_gain = if self.volume_gain.is_finite() {
            self.volume_gain.clamp(0.5, 20.0)
        } else {
            emigra_core::codec::VOLUME_GAIN
        };
        self.api_key = trimmed(self.api_key.as_deref());
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            language: self.language.clone(),
            voice: self.voice.clone(),
            model: self.model.clone(),
            chat_model: self.chat_model.clone(),
            preferred_input_device: self.preferred_input_device.clone(),
            platform: self.platform.clone(),
            volume_gain: self.volume_gain,
            has_api_key: self.resolve_api_key().is_some(),
        }
    }

    pub fn language(&self) -> Language {
        Language::from_code(&self.language)
    }

    pub fn platform_profile(&self) -> PlatformProfile {
        match self.platform.as_str() {
            "desktop" => PlatformProfile::default(),
            "android" => PlatformProfile {
                is_mobile: true,
                is_ios: false,
            },
            "ios" => PlatformProfile {
                is_mobile: true,
                is_ios: true,
            },
            _ => PlatformProfile::detect(),
        }
    }

    /// The service key: environment first, then the stored value.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_api_key_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        API_KEY_VARS
            .iter()
            .find_map(|name| trimmed(lookup(name).as_deref()))
            .or_else(|| self.api_key.clone())
    }

    pub fn engine_config(&self, api_key: Option<String>) -> EngineConfig {
        EngineConfig {
            api_key,
            model: self.model.clone(),
            voice: self.voice.clone(),
            volume_gain: self.volume_gain,
            preferred_input_device: self.preferred_input_device.clone(),
            platform: self.platform_profile(),
            ..EngineConfig::default()
        }
    }

    pub fn chat_config(&self, api_key: String) -> ChatConfig {
        ChatConfig {
            model: self.chat_model.clone(),
            ..ChatConfig::new(api_key)
        }
    }
}

pub fn normalize_platform(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "desktop" | "pc" => "desktop".into(),
        "android" | "mobile" => "android".into(),
        "ios" | "iphone" | "ipad" => "ios".into(),
        _ => "auto".into(),
    }
}

fn non_empty_or(raw: &str, fallback: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        fallback.into()
    } else {
        value.into()
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Emigra")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("emigra")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

use serde::Deserialize;
use std::{env, fs, io, path::Path};

const SETTINGS_FILENAME: &str = "settings.json";
const SETTINGS_ENV: &str = "MINDFLOW_SETTINGS";
const API_KEY_ENVS: [&str; 2] = ["MINDFLOW_API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("cannot parse settings file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub port: u16,
    pub save_file: String,
    pub static_dir: String,
    pub jwt_secret: String,
    pub jwt_expiration_in_minutes: i64,
    /// How long a live-feed socket may stay silent before it authenticates.
    pub auth_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub extraction: ExtractionSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    /// Falls back to the environment when absent.
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            save_file: "mindflow.redb".to_string(),
            static_dir: "../frontend/dist".to_string(),
            jwt_secret: "change-me-in-production".to_string(),
            jwt_expiration_in_minutes: 60 * 24 * 30,
            auth_timeout_secs: 4,
            sweep_interval_secs: 60,
            extraction: ExtractionSettings::default(),
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        ExtractionSettings {
            base_url: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            model: "gemini-2.5-flash".to_string(),
            request_timeout_secs: 120,
            api_key: None,
        }
    }
}

impl Settings {
    /// Load from `$MINDFLOW_SETTINGS` or `settings.json` in the working
    /// directory. A missing file yields defaults.
    pub fn load() -> Result<Settings, SettingsError> {
        let path = env::var(SETTINGS_ENV).unwrap_or_else(|_| SETTINGS_FILENAME.to_string());
        let mut settings = if Path::new(&path).exists() {
            Settings::from_file(&path)?
        } else {
            tracing::warn!(%path, "settings file not found, using defaults");
            Settings::default()
        };

        if settings.extraction.api_key.as_deref().is_none_or(str::is_empty) {
            settings.extraction.api_key = API_KEY_ENVS
                .iter()
                .find_map(|name| env::var(name).ok())
                .filter(|key| !key.is_empty());
        }
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Settings, SettingsError> {
        let content = fs::read_to_string(path)
            .map_err(|source| SettingsError::Read { path: path.to_string(), source })?;
        Settings::from_json(&content)
            .map_err(|source| SettingsError::Parse { path: path.to_string(), source })
    }

    pub fn from_json(content: &str) -> Result<Settings, serde_json::Error> {
        serde_json::from_str(content)
    }
}

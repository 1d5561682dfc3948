use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid api_url '{url}': {source}")]
    InvalidApiUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("api_url must use http or https, got '{scheme}'")]
    UnsupportedScheme { scheme: String },
    #[error("{key} must be a positive integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_url: String,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub export_dir: PathBuf,
    pub id_token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".into(),
            poll_interval_ms: 3000,
            request_timeout_secs: 60,
            export_dir: PathBuf::from("."),
            id_token: None,
        }
    }
}

impl ClientSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks `api_url` and normalizes it to have no trailing slash.
    pub fn validated(mut self) -> Result<Self, SettingsError> {
        let parsed = Url::parse(self.api_url.trim()).map_err(|source| {
            SettingsError::InvalidApiUrl {
                url: self.api_url.clone(),
                source,
            }
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SettingsError::UnsupportedScheme {
                scheme: parsed.scheme().to_string(),
            });
        }
        self.api_url = parsed.as_str().trim_end_matches('/').to_string();

        if self.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidNumber {
                key: "poll_interval_ms",
                value: "0".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(SettingsError::InvalidNumber {
                key: "request_timeout_secs",
                value: "0".into(),
            });
        }
        Ok(self)
    }
}

/// Defaults, then `client.toml` in the working directory, then the environment.
pub fn load_settings() -> Result<ClientSettings, SettingsError> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, SettingsError> {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientSettings>(&raw).map_err(|source| {
            SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => ClientSettings::default(),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if let Some(v) = env("API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("APP__POLL_INTERVAL_MS") {
        settings.poll_interval_ms = parse_positive("APP__POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = parse_positive("APP__REQUEST_TIMEOUT_SECS", &v)?;
    }

    if let Some(v) = env("APP__EXPORT_DIR") {
        settings.export_dir = PathBuf::from(v);
    }

    if let Some(v) = env("APP__ID_TOKEN") {
        if !v.trim().is_empty() {
            settings.id_token = Some(v);
        }
    }

    settings.validated()
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, SettingsError> {
    match value.trim().parse::<u64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(SettingsError::InvalidNumber {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;

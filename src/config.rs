use crate::capture::{MediaType, SyntheticConfig};
use crate::recording::BackgroundSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Where the shared storage area keeps its keys. Defaults to the data dir.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Where finished recordings are written. Defaults to the data dir.
    #[serde(default)]
    pub videos_dir: Option<PathBuf>,

    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    #[serde(default = "default_timer_interval")]
    pub timer_interval_ms: u64,

    #[serde(default)]
    pub media_type: MediaType,

    #[serde(default = "default_badge_color")]
    pub badge_color: String,

    #[serde(default = "default_recorder_page")]
    pub recorder_page: String,

    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Settings for the synthetic capture source.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_chunk_interval")]
    pub chunk_interval_ms: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_grant_permission")]
    pub grant_permission: bool,

    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_timer_interval() -> u64 {
    1000
}

fn default_badge_color() -> String {
    "#FF0000".to_string()
}

fn default_recorder_page() -> String {
    "recorder.html".to_string()
}

fn default_chunk_interval() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    4096
}

fn default_grant_permission() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: None,
            videos_dir: None,
            response_timeout_ms: default_response_timeout(),
            timer_interval_ms: default_timer_interval(),
            media_type: MediaType::default(),
            badge_color: default_badge_color(),
            recorder_page: default_recorder_page(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: default_chunk_interval(),
            chunk_size: default_chunk_size(),
            grant_permission: default_grant_permission(),
            max_duration_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/tabcast/config.json)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `config_path`, writing the defaults there if it does not exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("tabcast").join("config.json"))
    }

    fn data_dir() -> Result<PathBuf> {
        let data_dir = if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".local").join("share")
        };

        Ok(data_dir.join("tabcast"))
    }

    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    pub fn videos_dir(&self) -> Result<PathBuf> {
        match &self.videos_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::data_dir()?.join("videos")),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn background_settings(&self) -> BackgroundSettings {
        BackgroundSettings {
            timer_interval: Duration::from_millis(self.timer_interval_ms),
            badge_color: self.badge_color.clone(),
            recorder_page: self.recorder_page.clone(),
            default_media: self.media_type,
        }
    }

    pub fn synthetic_source(&self) -> SyntheticConfig {
        SyntheticConfig {
            chunk_interval: Duration::from_millis(self.capture.chunk_interval_ms),
            chunk_size: self.capture.chunk_size,
            grant_permission: self.capture.grant_permission,
            max_duration: self.capture.max_duration_secs.map(Duration::from_secs),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            return Err(anyhow::anyhow!("response_timeout_ms must be greater than 0"));
        }

        if self.timer_interval_ms == 0 {
            return Err(anyhow::anyhow!("timer_interval_ms must be greater than 0"));
        }

        if !is_hex_color(&self.badge_color) {
            return Err(anyhow::anyhow!(
                "badge_color must be a #RRGGBB color, got {:?}",
                self.badge_color
            ));
        }

        if self.recorder_page.is_empty() {
            return Err(anyhow::anyhow!("recorder_page cannot be empty"));
        }

        if self.capture.chunk_interval_ms == 0 || self.capture.chunk_size == 0 {
            return Err(anyhow::anyhow!(
                "capture.chunk_interval_ms and capture.chunk_size must be greater than 0"
            ));
        }

        Ok(())
    }
}

fn is_hex_color(color: &str) -> bool {
    color
        .strip_prefix('#')
        .is_some_and(|hex| hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tabcast").join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"media_type": "camera", "capture": {"grant_permission": false}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.media_type, MediaType::Camera);
        assert!(!config.capture.grant_permission);
        assert_eq!(config.capture.chunk_size, 4096);
        assert_eq!(config.response_timeout_ms, 5000);
        assert_eq!(config.badge_color, "#FF0000");
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            badge_color: "red".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            timer_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_dirs_win() {
        let config = Config {
            storage_dir: Some(PathBuf::from("/tmp/storage")),
            videos_dir: Some(PathBuf::from("/tmp/videos")),
            ..Config::default()
        };
        assert_eq!(config.storage_dir().unwrap(), PathBuf::from("/tmp/storage"));
        assert_eq!(config.videos_dir().unwrap(), PathBuf::from("/tmp/videos"));
    }
}

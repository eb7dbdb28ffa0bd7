use crate::core::errors::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Feature service (portal) configuration
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Base URL of the portal that issues tokens, e.g. https://www.arcgis.com
    pub portal_url: String,
    pub token_expiration_minutes: u32,
    pub http_timeout_seconds: u64,
}

/// Working storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Parent of every `processed_images_<batch>` working folder and archive
    pub upload_folder: PathBuf,
    /// Finished batches not downloaded within this many seconds are discarded
    pub batch_retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

/// Text overlay configuration
#[derive(Debug, Clone)]
pub struct AnnotationConfig {
    pub font_path: Option<PathBuf>,
    pub font_family: String,
    pub font_size: f32,
    pub text_offset_x: i32,
    pub text_offset_y: i32,
}

/// Batch pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Attachments downloaded at once within one batch
    pub download_concurrency: usize,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub portal: PortalConfig,
    pub storage: StorageConfig,
    pub annotation: AnnotationConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| parse_log_level(&s))
            .unwrap_or(Level::INFO);

        Self {
            server: ServerConfig {
                port: parse_env("SERVER_PORT").unwrap_or(5000),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            portal: PortalConfig {
                portal_url: env::var("PORTAL_URL")
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .unwrap_or_else(|_| "https://www.arcgis.com".to_string()),
                token_expiration_minutes: parse_env("TOKEN_EXPIRATION_MINUTES").unwrap_or(120),
                http_timeout_seconds: parse_env("HTTP_TIMEOUT_SECONDS").unwrap_or(60),
            },
            storage: StorageConfig {
                upload_folder: env::var("UPLOAD_FOLDER")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("uploads")),
                batch_retention_seconds: parse_env("BATCH_RETENTION_SECONDS").unwrap_or(3600),
                sweep_interval_seconds: parse_env("SWEEP_INTERVAL_SECONDS").unwrap_or(60),
            },
            annotation: AnnotationConfig {
                font_path: env::var("FONT_PATH")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
                font_family: env::var("FONT_FAMILY").unwrap_or_else(|_| "serif".to_string()),
                font_size: parse_env("FONT_SIZE").unwrap_or(30.0),
                text_offset_x: parse_env("TEXT_OFFSET_X").unwrap_or(10),
                text_offset_y: parse_env("TEXT_OFFSET_Y").unwrap_or(10),
            },
            pipeline: PipelineConfig {
                download_concurrency: parse_env("DOWNLOAD_CONCURRENCY").unwrap_or(4),
            },
        }
    }

    /// Configuration rooted at `upload_folder` with every other value at its default.
    /// Used by tests and the single-file binary, which never touch the environment.
    pub fn with_upload_folder(upload_folder: impl AsRef<Path>) -> Self {
        Self {
            server: ServerConfig {
                port: 5000,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            portal: PortalConfig {
                portal_url: "https://www.arcgis.com".to_string(),
                token_expiration_minutes: 120,
                http_timeout_seconds: 60,
            },
            storage: StorageConfig {
                upload_folder: upload_folder.as_ref().to_path_buf(),
                batch_retention_seconds: 3600,
                sweep_interval_seconds: 60,
            },
            annotation: AnnotationConfig {
                font_path: None,
                font_family: "serif".to_string(),
                font_size: 30.0,
                text_offset_x: 10,
                text_offset_y: 10,
            },
            pipeline: PipelineConfig {
                download_concurrency: 4,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let portal = &self.portal.portal_url;
        if !(portal.starts_with("https://") || portal.starts_with("http://")) {
            return Err(ConfigError::InvalidPortalUrl(portal.clone()));
        }

        if self.portal.token_expiration_minutes == 0 {
            return Err(ConfigError::InvalidTokenExpiration(
                self.portal.token_expiration_minutes,
            ));
        }

        // The upload folder itself is created lazily, but its parent must exist
        let upload = &self.storage.upload_folder;
        if upload.as_os_str().is_empty() {
            return Err(ConfigError::InvalidUploadFolder("empty path".to_string()));
        }
        if let Some(parent) = upload.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidUploadFolder(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        if !(6.0..=200.0).contains(&self.annotation.font_size) {
            return Err(ConfigError::InvalidFontSize(self.annotation.font_size));
        }

        if let Some(font_path) = &self.annotation.font_path {
            if !font_path.exists() {
                return Err(ConfigError::FontNotFound(font_path.display().to_string()));
            }
        }

        if self.pipeline.download_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(
                self.pipeline.download_concurrency,
            ));
        }

        if self.storage.sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidSweepInterval(
                self.storage.sweep_interval_seconds,
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn portal_url(&self) -> &str {
        &self.portal.portal_url
    }

    pub fn upload_folder(&self) -> &Path {
        &self.storage.upload_folder
    }

    pub fn download_concurrency(&self) -> usize {
        self.pipeline.download_concurrency
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_secs(self.storage.batch_retention_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.storage.sweep_interval_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_log_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_upload_folder(dir.path().join("uploads"));
        assert!(config.validate().is_ok());
        assert_eq!(config.annotation.font_size, 30.0);
        assert_eq!(config.annotation.text_offset_x, 10);
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::with_upload_folder(dir.path().join("uploads"));
        config.pipeline.download_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency(0))
        ));

        let mut config = Config::with_upload_folder(dir.path().join("uploads"));
        config.portal.portal_url = "ftp://portal".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPortalUrl(_))
        ));

        let mut config = Config::with_upload_folder(dir.path().join("missing/uploads"));
        config.annotation.font_size = 30.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUploadFolder(_))
        ));

        let mut config = Config::with_upload_folder(dir.path().join("uploads"));
        config.annotation.font_path = Some(dir.path().join("nope.ttf"));
        assert!(matches!(config.validate(), Err(ConfigError::FontNotFound(_))));

        let mut config = Config::with_upload_folder(dir.path().join("uploads"));
        config.storage.sweep_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSweepInterval(0))
        ));
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_log_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_log_level("loud"), None);
    }
}

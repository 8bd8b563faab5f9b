//! Relay configuration.
//!
//! Loaded from the JSON file named by `RELAY_CONFIG` when set, otherwise from
//! environment variables:
//!
//! - `SOURCE_URL` (required): media file to relay
//! - `RTMP_URL` + `STREAM_KEY` (required): primary endpoint
//! - `BACKUP_RTMP_URL` + `BACKUP_STREAM_KEY`: backup endpoint
//! - `FFMPEG_PATH` (default `ffmpeg`)
//! - `CACHE_DIR` (default `./cache`)
//! - `LOOP_SOURCE` (default true)
//! - `SEGMENT_DURATION` seconds (default 4)
//! - `MAX_CACHE_SECONDS` (default 300)
//! - `CONTINUITY_ENABLED` (default true)
//! - `HEALTH_INTERVAL_SECS` (default 15)
//! - `LOG_DIR`: enables daily log files

use std::path::{Path, PathBuf};
use std::time::Duration;

use process_utils::GracefulStop;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheConfig;
use crate::continuity::ContinuityConfig;
use crate::health::HealthConfig;
use crate::process::RestartPolicyConfig;
use crate::publisher::{EndpointConfig, PRIMARY_PRIORITY, PublisherConfig};
use crate::utils::url::normalize_source_url;
use crate::{Error, Result};

/// Environment variable naming a JSON config file.
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub source_url: String,
    /// Start over when the source ends.
    #[serde(default = "default_true")]
    pub loop_source: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub continuity: ContinuityConfig,
    #[serde(default)]
    pub restart: RestartPolicyConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Bounded wait for a process to exit after a stop request.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_stop_timeout_secs() -> u64 {
    10
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            loop_source: true,
            ffmpeg_path: default_ffmpeg_path(),
            cache: CacheConfig::default(),
            continuity: ContinuityConfig::default(),
            restart: RestartPolicyConfig::default(),
            publisher: PublisherConfig::default(),
            health: HealthConfig::default(),
            log_dir: None,
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// `rtmp://host/app` + `key` → `rtmp://host/app/key`.
pub fn join_stream_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` if set, otherwise from the environment, then validate.
    pub fn load() -> Result<Self> {
        let config = match env_string(CONFIG_FILE_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io_path("reading config", path, e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("Invalid config file {}: {}", path.display(), e)))?;
        config.source_url = normalize_source_url(&config.source_url);
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Build from environment variables. Missing values stay empty and are
    /// reported by [`validate`](Self::validate).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(source) = env_string("SOURCE_URL") {
            config.source_url = normalize_source_url(&source);
        }
        if let Some(path) = env_string("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(dir) = env_string("CACHE_DIR") {
            config.cache.cache_dir = PathBuf::from(dir);
        }
        if let Some(looping) = env_bool("LOOP_SOURCE") {
            config.loop_source = looping;
        }
        if let Some(duration) = env_parse::<f64>("SEGMENT_DURATION") {
            config.cache.segment_duration_secs = duration;
        }
        if let Some(max) = env_parse::<f64>("MAX_CACHE_SECONDS") {
            config.cache.max_cache_secs = max;
        }
        if let Some(enabled) = env_bool("CONTINUITY_ENABLED") {
            config.continuity.enabled = enabled;
        }
        if let Some(interval) = env_parse::<u64>("HEALTH_INTERVAL_SECS") {
            config.health.interval_secs = interval;
        }
        config.log_dir = env_string("LOG_DIR").map(PathBuf::from);

        if let (Some(url), Some(key)) = (env_string("RTMP_URL"), env_string("STREAM_KEY")) {
            config.publisher.endpoints.push(EndpointConfig {
                name: "primary".to_string(),
                url: join_stream_url(&url, &key),
                priority: PRIMARY_PRIORITY,
                profile: None,
            });
        }
        if let (Some(url), Some(key)) = (env_string("BACKUP_RTMP_URL"), env_string("BACKUP_STREAM_KEY")) {
            config.publisher.endpoints.push(EndpointConfig {
                name: "backup".to_string(),
                url: join_stream_url(&url, &key),
                priority: PRIMARY_PRIORITY + 1,
                profile: None,
            });
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.is_empty() {
            return Err(Error::config("SOURCE_URL is not set"));
        }
        if url::Url::parse(&self.source_url).is_err() && !Path::new(&self.source_url).exists() {
            return Err(Error::config(format!(
                "Source is neither a URL nor an existing file: {}",
                self.source_url
            )));
        }
        if !self
            .publisher
            .endpoints
            .iter()
            .any(|e| e.priority <= PRIMARY_PRIORITY)
        {
            return Err(Error::config("A primary endpoint is required (RTMP_URL and STREAM_KEY)"));
        }
        if let Some(endpoint) = self
            .publisher
            .endpoints
            .iter()
            .find(|e| !e.url.starts_with("rtmp://") && !e.url.starts_with("rtmps://"))
        {
            return Err(Error::config(format!(
                "Endpoint {} must use rtmp:// or rtmps://",
                endpoint.name
            )));
        }
        if self.cache.segment_duration_secs.is_nan() || self.cache.segment_duration_secs <= 0.0 {
            return Err(Error::config("Segment duration must be positive"));
        }
        if self.cache.max_cache_secs < self.cache.segment_duration_secs {
            return Err(Error::config("Cache window must hold at least one segment"));
        }
        if self.ffmpeg_path.is_empty() {
            return Err(Error::config("FFMPEG_PATH must not be empty"));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// How child processes are asked to quit: `q` on stdin, killed after the stop timeout.
    pub fn graceful_stop(&self) -> GracefulStop {
        GracefulStop {
            grace: self.stop_timeout(),
            ..GracefulStop::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RelayConfig {
        RelayConfig {
            source_url: "https://example.com/video.mp4".to_string(),
            publisher: PublisherConfig {
                endpoints: vec![EndpointConfig {
                    name: "primary".to_string(),
                    url: "rtmp://a.rtmp.youtube.com/live2/key".to_string(),
                    priority: 1,
                    profile: None,
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let missing_source = RelayConfig {
            source_url: String::new(),
            ..valid()
        };
        assert!(matches!(missing_source.validate(), Err(Error::Configuration(_))));

        let mut no_primary = valid();
        no_primary.publisher.endpoints[0].priority = 2;
        assert!(no_primary.validate().is_err());

        let mut http_endpoint = valid();
        http_endpoint.publisher.endpoints[0].url = "http://example.com/live".to_string();
        assert!(http_endpoint.validate().is_err());

        let mut tiny_window = valid();
        tiny_window.cache.max_cache_secs = 1.0;
        assert!(tiny_window.validate().is_err());
    }

    #[test]
    fn test_graceful_stop_follows_stop_timeout() {
        let config = RelayConfig {
            stop_timeout_secs: 3,
            ..valid()
        };
        let stop = config.graceful_stop();
        assert_eq!(stop.grace, Duration::from_secs(3));
        assert_eq!(stop.quit_command, b"q");
        assert_eq!(RelayConfig::default().graceful_stop().grace, Duration::from_secs(10));
    }

    #[test]
    fn test_join_stream_url() {
        assert_eq!(
            join_stream_url("rtmp://a.rtmp.youtube.com/live2/", "abcd"),
            "rtmp://a.rtmp.youtube.com/live2/abcd"
        );
        assert_eq!(
            join_stream_url("rtmp://a.rtmp.youtube.com/live2", "abcd"),
            "rtmp://a.rtmp.youtube.com/live2/abcd"
        );
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "source_url": "https://example.com/video.mp4",
            "publisher": {
                "endpoints": [
                    { "name": "primary", "url": "rtmp://host/app/key" },
                    { "name": "backup", "url": "rtmp://host2/app/key2", "priority": 2 }
                ]
            }
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert!(config.loop_source);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.publisher.endpoints[0].priority, 1);
        assert_eq!(config.publisher.max_reconnects, 10);
        assert_eq!(config.health.interval_secs, 15);
        assert_eq!(config.restart.max_attempts, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_normalizes_source() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "source_url": "https://www.dropbox.com/s/abc/video.mp4?dl=0",
                "publisher": { "endpoints": [{ "name": "p", "url": "rtmp://host/app/key" }] }
            }"#,
        )
        .unwrap();

        let config = RelayConfig::from_file(&path).unwrap();
        assert!(config.source_url.starts_with("https://dl.dropboxusercontent.com/"));

        let err = RelayConfig::from_file(&temp.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
    }
}

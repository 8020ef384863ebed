use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::FatalError;

/// Environment variable holding the metadata provider API key
pub const API_KEY_ENV: &str = "TMDB_API_KEY";

/// Configuration for a curator run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    /// Root directory containing Queue, Staged, Completed and Errors
    pub media_root: PathBuf,
    /// Lowercase video container extensions accepted by the classifier (no dot)
    pub extensions: Vec<String>,
    /// Parallel transcode workers
    pub workers: usize,
    /// Log intended moves and encodes without touching the filesystem
    pub dry_run: bool,
    /// Move staged files to Completed without re-encoding
    pub skip_transcode: bool,
    /// Keep the staged original next to the transcoded output
    pub keep_source: bool,
    /// Replace differing files at the destination instead of quarantining
    pub overwrite: bool,
    /// Explicit ffmpeg video encoder name (e.g. "libx264", "h264_nvenc")
    pub encoder_override: Option<String>,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Fixed target profile for re-encoding
    pub profile: TranscodeProfile,
    /// Metadata provider settings
    pub provider: ProviderConfig,
    /// Scoring thresholds used during resolution
    pub resolver: ResolverConfig,
    /// Smallest accepted output size relative to the source (e.g. 0.10 = 10%)
    pub min_output_ratio: f64,
}

/// Target encoding profile shared by every transcode in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeProfile {
    /// Codec family the output must use ("h264")
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub max_audio_channels: u32,
    /// Output container extension ("mp4")
    pub container: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub language: String,
    pub request_timeout_secs: u64,
    /// Total attempts per provider call, first try included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Lowest score (0.0..=1.0) a match may have to be accepted
    pub min_confidence: f64,
    /// Runner-up within this distance of the best score makes the result ambiguous
    pub tie_margin: f64,
}

/// Provider API key from the environment. Missing or blank is fatal.
pub fn read_api_key() -> Result<String, FatalError> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(FatalError::CredentialMissing(API_KEY_ENV)),
    }
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for TranscodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "h264".to_string(),
            crf: 23,
            preset: "medium".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            max_audio_channels: 2,
            container: "mp4".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.themoviedb.org/3".to_string(),
            language: "en-US".to_string(),
            request_timeout_secs: 30,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl ProviderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            tie_margin: 0.05,
        }
    }
}

impl CuratorConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            media_root: PathBuf::from("./media"),
            extensions: ["mkv", "mp4", "avi", "mov", "m4v", "webm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            workers: 2,
            dry_run: false,
            skip_transcode: false,
            keep_source: false,
            overwrite: false,
            encoder_override: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            profile: TranscodeProfile::default(),
            provider: ProviderConfig::default(),
            resolver: ResolverConfig::default(),
            min_output_ratio: 0.10,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.workers = config.workers.max(1);
        Ok(config)
    }

    /// Check whether an extension (without dot, any case) is an accepted video container
    pub fn accepts_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = CuratorConfig::load_config(Some(Path::new("/nonexistent/curator.toml"))).unwrap();
        assert_eq!(cfg.workers, 2);
        assert!(!cfg.overwrite);
        assert_eq!(cfg.profile.container, "mp4");
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "workers = 6\ndry_run = true\n\n[resolver]\ntie_margin = 0.1").unwrap();

        let cfg = CuratorConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.workers, 6);
        assert!(cfg.dry_run);
        assert_eq!(cfg.resolver.tie_margin, 0.1);
        assert_eq!(cfg.resolver.min_confidence, 0.6);
        assert_eq!(cfg.provider.max_attempts, 4);
    }

    #[test]
    fn test_json_config_and_zero_workers_clamped() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"workers": 0, "encoder_override": "libx264"}}"#).unwrap();

        let cfg = CuratorConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.encoder_override.as_deref(), Some("libx264"));
    }

    #[test]
    fn test_accepts_extension_case_insensitive() {
        let cfg = CuratorConfig::default();
        assert!(cfg.accepts_extension("MKV"));
        assert!(cfg.accepts_extension("mp4"));
        assert!(!cfg.accepts_extension("srt"));
    }
}

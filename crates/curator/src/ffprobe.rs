use std::path::Path;
use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use tokio::process::Command;
use crate::config::TranscodeProfile;

/// Subset of ffprobe `-show_streams -show_format` output
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: String,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub channels: Option<u32>,
}

/// Audio codecs playable without re-encoding in the target container
const COMPATIBLE_AUDIO: &[&str] = &["aac", "mp3"];

impl FFProbeData {
    fn first_of(&self, kind: &str) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some(kind))
    }

    pub fn has_stream(&self, kind: &str) -> bool {
        self.first_of(kind).is_some()
    }

    pub fn video_codec(&self) -> Option<&str> {
        self.first_of("video").and_then(|s| s.codec_name.as_deref())
    }

    pub fn audio_codec(&self) -> Option<&str> {
        self.first_of("audio").and_then(|s| s.codec_name.as_deref())
    }

    /// Already in the target shape: container by extension, first video stream
    /// in the target codec family, first audio stream compatible and within the
    /// channel cap.
    pub fn is_compatible(&self, path: &Path, profile: &TranscodeProfile) -> bool {
        let container_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(&profile.container))
            .unwrap_or(false);

        let video_ok = match self.video_codec() {
            Some(codec) => codec == profile.video_codec || (profile.video_codec == "h264" && codec == "avc"),
            None => false,
        };

        let audio_ok = self.first_of("audio").is_some_and(|s| {
            s.codec_name.as_deref().is_some_and(|c| COMPATIBLE_AUDIO.contains(&c))
                && s.channels.is_some_and(|ch| ch <= profile.max_audio_channels)
        });

        container_ok && video_ok && audio_ok
    }
}

/// An encode must keep a video stream, and an audio stream when the source had one
pub fn check_output(source: &FFProbeData, output: &FFProbeData) -> Result<(), String> {
    if !output.has_stream("video") {
        return Err("encoded output has no video stream".to_string());
    }
    if source.has_stream("audio") && !output.has_stream("audio") {
        return Err("encoded output lost the audio stream".to_string());
    }
    Ok(())
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("ffprobe: probing {}", file_path.display());
    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        );
    }

    let data: FFProbeData = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;
    Ok(data)
}

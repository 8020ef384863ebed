use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use crate::config::{CuratorConfig, TranscodeProfile};
use crate::error::FatalError;
use crate::ffprobe;

/// Software encoder used when no hardware encoder is usable
pub const SOFTWARE_ENCODER: &str = "libx264";

/// Lines of encoder stderr kept for failure reasons
const STDERR_TAIL_LINES: usize = 20;

/// Hardware encoders to try on this platform, in preference order
pub fn preferred_hardware(os: &str) -> &'static [&'static str] {
    match os {
        "macos" => &["h264_videotoolbox"],
        _ => &["h264_nvenc", "h264_qsv"],
    }
}

/// Result of one encoder run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    Finished,
    Failed { exit_code: Option<i32>, stderr_tail: String },
    /// Killed because the run was interrupted
    Cancelled,
}

/// Capability the transcoder drives: a compatibility probe and one encode
#[async_trait]
pub trait Encoder: Send + Sync {
    /// ffmpeg name of the video encoder in use
    fn name(&self) -> &str;

    /// True when `input` can go to Completed without re-encoding
    async fn is_compatible(&self, input: &Path) -> Result<bool>;

    /// Encode `input` into `output` with the run's fixed profile. `Err` only
    /// for failures to launch the tool at all.
    async fn encode(&self, input: &Path, output: &Path, cancel: &CancellationToken) -> Result<EncodeOutcome>;

    /// Check a finished encode is playable media. `Err` carries the reason.
    async fn verify_output(&self, input: &Path, output: &Path) -> Result<()>;
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
}

impl FFmpegVersion {
    /// "ffmpeg version 6.1.1-3ubuntu5 ..." -> 6.1; git builds ("N-112345-g...") -> 0.0
    pub fn parse(first_line: &str) -> Result<Self> {
        let token = first_line
            .split_whitespace()
            .skip_while(|w| *w != "version")
            .nth(1)
            .ok_or_else(|| anyhow!("No version number found in: {}", first_line))?;

        if !token.starts_with(|c: char| c.is_ascii_digit()) {
            return Ok(FFmpegVersion { major: 0, minor: 0 });
        }
        let mut numbers = token
            .split(|c: char| !c.is_ascii_digit())
            .map(|p| p.parse::<u32>().ok());
        let major = numbers.next().flatten().unwrap_or(0);
        let minor = numbers.next().flatten().unwrap_or(0);
        Ok(FFmpegVersion { major, minor })
    }
}

/// Parse the encoder names out of `ffmpeg -encoders`
pub fn parse_encoder_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            flags.starts_with('V').then(|| name.to_string())
        })
        .collect()
}

/// Encoder fallback chain: explicit override, platform hardware, software.
/// `usable` is consulted for hardware encoders only.
pub fn select_encoder<F>(
    override_name: Option<&str>,
    available: &[String],
    os: &str,
    mut usable: F,
) -> Result<String, FatalError>
where
    F: FnMut(&str) -> bool,
{
    let listed = |name: &str| available.iter().any(|a| a == name);

    if let Some(name) = override_name {
        if listed(name) {
            return Ok(name.to_string());
        }
        return Err(FatalError::EncoderUnavailable(format!(
            "requested encoder '{}' is not offered by this ffmpeg build",
            name
        )));
    }

    for hw in preferred_hardware(os) {
        if listed(hw) && usable(hw) {
            return Ok(hw.to_string());
        }
    }

    if listed(SOFTWARE_ENCODER) {
        return Ok(SOFTWARE_ENCODER.to_string());
    }
    Err(FatalError::EncoderUnavailable(format!(
        "no H.264 encoder available (tried {:?} and {})",
        preferred_hardware(os),
        SOFTWARE_ENCODER
    )))
}

/// Map a container extension to the ffmpeg muxer name
fn muxer_name(container: &str) -> &str {
    match container {
        "mkv" => "matroska",
        "m4v" => "ipod",
        other => other,
    }
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder<'a> {
    profile: &'a TranscodeProfile,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(profile: &'a TranscodeProfile) -> Self {
        CommandBuilder { profile }
    }

    /// Rate control flags for each encoder family; they disagree on names
    fn quality_args(&self, encoder: &str) -> Vec<String> {
        let crf = self.profile.crf.to_string();
        match encoder {
            "h264_nvenc" => vec!["-rc".into(), "vbr".into(), "-cq".into(), crf, "-preset".into(), "p5".into()],
            "h264_qsv" => vec!["-global_quality".into(), crf, "-preset".into(), self.profile.preset.clone()],
            "h264_videotoolbox" => {
                // Quality scale runs 1..=100, higher is better
                let q = (100 - 2 * i32::from(self.profile.crf)).clamp(1, 100);
                vec!["-q:v".into(), q.to_string(), "-allow_sw".into(), "1".into()]
            }
            _ => vec!["-crf".into(), crf, "-preset".into(), self.profile.preset.clone()],
        }
    }

    /// Full encode command: first video stream re-encoded, first audio
    /// stream (optional) re-encoded within the channel cap, fixed container.
    pub fn build_encode_command(&self, input: &Path, output: &Path, encoder: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-c:v".into(),
            encoder.to_string(),
        ];
        args.extend(self.quality_args(encoder));
        args.extend([
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            self.profile.audio_codec.clone(),
            "-b:a".to_string(),
            self.profile.audio_bitrate.clone(),
            "-ac".to_string(),
            self.profile.max_audio_channels.to_string(),
        ]);
        if self.profile.container == "mp4" {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        // The output carries a .partial name, so the muxer is never guessed
        args.extend([
            "-f".to_string(),
            muxer_name(&self.profile.container).to_string(),
            output.to_string_lossy().to_string(),
        ]);
        args
    }

    /// One-frame synthetic encode used to check that a hardware encoder works
    pub fn build_smoke_test_command(&self, encoder: &str) -> Vec<String> {
        [
            "-hide_banner", "-nostdin", "-f", "lavfi", "-i", "color=c=black:s=256x256:d=0.1",
            "-frames:v", "1", "-c:v", encoder, "-f", "null", "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Run a subordinate process to completion, or kill it when `cancel` fires.
/// Keeps the last lines of stderr for failure reasons.
pub async fn run_process(bin: &Path, args: &[String], cancel: &CancellationToken) -> Result<EncodeOutcome> {
    debug!("Executing: {} {}", bin.display(), args.join(" "));

    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", bin.display()))?;

    let stderr = child.stderr.take().ok_or_else(|| anyhow!("Failed to capture stderr"))?;
    let stderr_handle = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status.context("Failed to wait for process")?),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = waited else {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", bin.display(), e);
        }
        stderr_handle.abort();
        return Ok(EncodeOutcome::Cancelled);
    };

    let stderr_tail = stderr_handle.await.unwrap_or_default();
    if status.success() {
        Ok(EncodeOutcome::Finished)
    } else {
        Ok(EncodeOutcome::Failed { exit_code: status.code(), stderr_tail })
    }
}

/// The external ffmpeg/ffprobe pair with an encoder resolved once per run
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    encoder: String,
    profile: TranscodeProfile,
}

impl FfmpegEncoder {
    /// Verify ffmpeg is present and resolve the encoder chain. Any failure
    /// here is fatal for the run.
    pub async fn detect(cfg: &CuratorConfig) -> Result<Self, FatalError> {
        // Compatibility checks and output verification both need ffprobe
        let probe_version = detect_version(&cfg.ffprobe_bin, "ffprobe")
            .await
            .map_err(|e| FatalError::EncoderUnavailable(format!("{:#}", e)))?;
        info!("Found ffprobe {}.{} at {}", probe_version.major, probe_version.minor, cfg.ffprobe_bin.display());

        let version = detect_version(&cfg.ffmpeg_bin, "ffmpeg")
            .await
            .map_err(|e| FatalError::EncoderUnavailable(format!("{:#}", e)))?;
        info!("Found ffmpeg {}.{} at {}", version.major, version.minor, cfg.ffmpeg_bin.display());

        let available = detect_encoders(&cfg.ffmpeg_bin)
            .await
            .map_err(|e| FatalError::EncoderUnavailable(format!("{:#}", e)))?;

        // Hardware encoders are often compiled in without a device behind them
        let mut working = Vec::new();
        for hw in preferred_hardware(std::env::consts::OS) {
            if cfg.encoder_override.is_none() && available.iter().any(|a| a == hw) {
                if smoke_test(&cfg.ffmpeg_bin, &cfg.profile, hw).await {
                    working.push(hw.to_string());
                } else {
                    debug!("Hardware encoder {} is listed but not usable", hw);
                }
            }
        }

        let encoder = select_encoder(
            cfg.encoder_override.as_deref(),
            &available,
            std::env::consts::OS,
            |hw| working.iter().any(|w| w == hw),
        )?;
        info!("Selected video encoder: {}", encoder);

        Ok(Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            encoder,
            profile: cfg.profile.clone(),
        })
    }
}

/// `<tool> -version`; both ffmpeg and ffprobe print the same banner shape
async fn detect_version(bin: &Path, tool: &str) -> Result<FFmpegVersion> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .await
        .with_context(|| format!("Failed to execute {} at: {}", tool, bin.display()))?;

    if !output.status.success() {
        return Err(anyhow!("{} version check failed", tool));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next()
        .ok_or_else(|| anyhow!("Empty output from {} -version", tool))?;

    FFmpegVersion::parse(first_line)
}

async fn detect_encoders(ffmpeg_bin: &Path) -> Result<Vec<String>> {
    let output = Command::new(ffmpeg_bin)
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .await
        .with_context(|| format!("Failed to query FFmpeg encoders at: {}", ffmpeg_bin.display()))?;

    if !output.status.success() {
        return Err(anyhow!("FFmpeg encoder query failed"));
    }
    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

async fn smoke_test(ffmpeg_bin: &Path, profile: &TranscodeProfile, encoder: &str) -> bool {
    let args = CommandBuilder::new(profile).build_smoke_test_command(encoder);
    matches!(
        run_process(ffmpeg_bin, &args, &CancellationToken::new()).await,
        Ok(EncodeOutcome::Finished)
    )
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.encoder
    }

    async fn is_compatible(&self, input: &Path) -> Result<bool> {
        let data = ffprobe::probe_file(&self.ffprobe_bin, input).await?;
        Ok(data.is_compatible(input, &self.profile))
    }

    async fn encode(&self, input: &Path, output: &Path, cancel: &CancellationToken) -> Result<EncodeOutcome> {
        let args = CommandBuilder::new(&self.profile).build_encode_command(input, output, &self.encoder);
        run_process(&self.ffmpeg_bin, &args, cancel).await
    }

    async fn verify_output(&self, input: &Path, output: &Path) -> Result<()> {
        let source = ffprobe::probe_file(&self.ffprobe_bin, input).await?;
        let encoded = ffprobe::probe_file(&self.ffprobe_bin, output)
            .await
            .context("ffprobe could not read the encoded output")?;
        ffprobe::check_output(&source, &encoded).map_err(|reason| anyhow!(reason))
    }
}

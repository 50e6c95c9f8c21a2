//! Media probing via ffprobe.
//!
//! Collects the stream and format metadata the pipeline needs: whether a clip
//! decodes at all, its geometry (for crop decisions), whether it carries audio,
//! and its duration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or rejected the file.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First video stream of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "h264", "hevc").
    pub codec_name: String,
    /// Width in pixels, 0 when unknown.
    pub width: u32,
    /// Height in pixels, 0 when unknown.
    pub height: u32,
    /// Frames per second from `r_frame_rate`.
    pub frame_rate: Option<f64>,
    pub pix_fmt: Option<String>,
}

/// First audio stream of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    pub codec_name: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
    /// Container duration in seconds.
    pub duration_secs: Option<f64>,
}

impl MediaInfo {
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Known, non-zero video dimensions.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.video
            .as_ref()
            .filter(|v| v.width > 0 && v.height > 0)
            .map(|v| (v.width, v.height))
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub pix_fmt: Option<String>,
        pub channels: Option<u32>,
        pub sample_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Probes a media file.
///
/// Runs `ffprobe -v error -print_format json -show_streams -show_format <path>`
/// and parses the JSON output.
pub fn probe_file(ffprobe: &Path, path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses a rational like `30000/1001` or a plain number.
fn parse_rational(value: &str) -> Option<f64> {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => value.trim().parse().ok(),
    }
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Parses ffprobe JSON output into a MediaInfo.
///
/// Only the first video and first audio stream are kept. The format duration
/// wins; the video stream duration is the fallback.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let mut video = None;
    let mut audio = None;
    let mut stream_duration = None;

    for stream in ffprobe.streams.unwrap_or_default() {
        let codec_name = stream.codec_name.clone().unwrap_or_default();

        match stream.codec_type.as_deref().unwrap_or("") {
            "video" if video.is_none() => {
                stream_duration = parse_seconds(stream.duration.as_ref());
                video = Some(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate: stream
                        .r_frame_rate
                        .as_deref()
                        .and_then(parse_rational)
                        .filter(|fps| *fps > 0.0),
                    pix_fmt: stream.pix_fmt,
                });
            }
            "audio" if audio.is_none() => {
                audio = Some(AudioStream {
                    codec_name,
                    channels: stream.channels.unwrap_or(0),
                    sample_rate: stream.sample_rate.and_then(|sr| sr.parse().ok()),
                });
            }
            _ => {}
        }
    }

    let duration_secs = ffprobe
        .format
        .as_ref()
        .and_then(|f| parse_seconds(f.duration.as_ref()))
        .or(stream_duration);

    Ok(MediaInfo {
        video,
        audio,
        duration_secs,
    })
}

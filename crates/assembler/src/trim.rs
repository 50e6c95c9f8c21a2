//! Duration trimming
//!
//! Cuts a normalized clip to its requested duration. Re-encoding cuts are
//! frame-accurate; byte-copy cuts can only land on keyframes and may overshoot
//! by a whole GOP. Assembled timelines always need sync, so the pipeline
//! re-encodes unless the caller forces byte-copy, and each clip is cut exactly
//! once.

use crate::clip::{NormalizedClip, OutputProfile, TrimmedClip};
use crate::config::TrimPolicy;
use crate::engine::{EngineCommand, MediaEngine};
use crate::error::{AssemblyError, Stage};
use crate::normalize::VIDEO_TRACK_TIMESCALE;
use std::path::Path;
use std::time::Duration;

/// How a single cut is performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    Reencode,
    ByteCopy,
}

/// Resolve the configured policy for one cut
///
/// `needs_sync` is true whenever the result joins a fixed-length timeline or
/// must stay aligned with a voice track.
pub fn select_trim_mode(policy: TrimPolicy, needs_sync: bool) -> TrimMode {
    match policy {
        TrimPolicy::Reencode => TrimMode::Reencode,
        TrimPolicy::Copy => TrimMode::ByteCopy,
        TrimPolicy::Auto if needs_sync => TrimMode::Reencode,
        TrimPolicy::Auto => TrimMode::ByteCopy,
    }
}

fn secs(value: f64) -> String {
    format!("{:.3}", value)
}

/// Engine invocation for one cut
///
/// `pad_secs` extends the clip with its last frame before the cut when the
/// source is shorter than requested; ignored for byte-copy. Re-encoded audio is
/// always padded with silence so it ends with the video at the cut.
pub fn build_trim_command(
    input: &Path,
    duration: Duration,
    mode: TrimMode,
    has_audio: bool,
    pad_secs: Option<f64>,
    profile: &OutputProfile,
    output: &Path,
) -> EngineCommand {
    let mut cmd = EngineCommand::new();
    cmd.arg("-i").arg(input);

    match mode {
        TrimMode::ByteCopy => {
            cmd.arg("-t")
                .arg(secs(duration.as_secs_f64()))
                .args(["-c", "copy"]);
        }
        TrimMode::Reencode => {
            if let Some(pad) = pad_secs.filter(|p| *p > 0.0) {
                cmd.arg("-vf")
                    .arg(format!("tpad=stop_mode=clone:stop_duration={}", secs(pad)));
            }
            if has_audio {
                cmd.args(["-af", "apad"]);
            }
            cmd.arg("-t").arg(secs(duration.as_secs_f64()));
            cmd.args(profile.encoder.video_args());
            if has_audio {
                cmd.args(["-c:a", "aac", "-ar"])
                    .arg(profile.sample_rate.to_string())
                    .arg("-ac")
                    .arg(profile.channels.to_string());
            } else {
                cmd.arg("-an");
            }
        }
    }

    cmd.args([
        "-avoid_negative_ts",
        "make_zero",
        "-video_track_timescale",
        VIDEO_TRACK_TIMESCALE,
        "-movflags",
        "+faststart",
    ])
    .arg(output);
    cmd
}

/// Whether a realized length is within tolerance of the request
pub fn within_tolerance(realized_secs: f64, requested: Duration, tolerance: Duration) -> bool {
    (realized_secs - requested.as_secs_f64()).abs() <= tolerance.as_secs_f64()
}

pub struct DurationTrimmer<'a> {
    engine: &'a dyn MediaEngine,
    profile: &'a OutputProfile,
    mode: TrimMode,
    tolerance: Duration,
}

impl<'a> DurationTrimmer<'a> {
    pub fn new(
        engine: &'a dyn MediaEngine,
        profile: &'a OutputProfile,
        mode: TrimMode,
        tolerance: Duration,
    ) -> Self {
        Self {
            engine,
            profile,
            mode,
            tolerance,
        }
    }

    pub fn mode(&self) -> TrimMode {
        self.mode
    }

    /// Cut `clip` to `duration`, writing to the run-scoped `output`
    pub fn trim(
        &self,
        clip: &NormalizedClip,
        duration: Duration,
        output: &Path,
    ) -> Result<TrimmedClip, AssemblyError> {
        let requested = duration.as_secs_f64();
        let available = self
            .engine
            .probe(&clip.path)
            .ok()
            .and_then(|info| info.duration_secs);

        let pad_secs = match available {
            Some(have) if have + self.tolerance.as_secs_f64() >= requested => None,
            Some(have) => Some(requested - have),
            None => Some(requested),
        };
        if let (Some(pad), TrimMode::Reencode) = (pad_secs, self.mode) {
            tracing::debug!(
                clip = %clip.source.display(),
                requested,
                pad,
                "clip shorter than requested, padding with last frame"
            );
        }

        let cmd = build_trim_command(
            &clip.path,
            duration,
            self.mode,
            clip.has_audio(),
            pad_secs,
            self.profile,
            output,
        );
        self.engine
            .run(&cmd)
            .map_err(|e| AssemblyError::encode(Stage::Trim, &clip.source, e))?;

        let realized_secs = self
            .engine
            .probe(output)
            .ok()
            .and_then(|info| info.duration_secs);

        match realized_secs {
            Some(realized) if !within_tolerance(realized, duration, self.tolerance) => {
                tracing::warn!(
                    clip = %clip.source.display(),
                    requested,
                    realized,
                    mode = ?self.mode,
                    "trimmed length outside tolerance"
                );
            }
            None => {
                tracing::debug!(output = %output.display(), "could not probe trimmed length");
            }
            _ => {}
        }

        Ok(TrimmedClip {
            path: output.to_path_buf(),
            source: clip.source.clone(),
            requested: duration,
            realized_secs,
            has_audio: clip.has_audio(),
        })
    }
}

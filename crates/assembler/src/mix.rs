//! Voice track mixing

use crate::clip::{AssemblyResult, ConcatenatedClip};
use crate::engine::{EngineCommand, MediaEngine};
use crate::error::{AssemblyError, Stage};
use std::path::Path;

/// Which audio path a mix takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixPlan {
    /// No usable voice track; the video passes through unchanged
    KeepExisting,
    /// Voice becomes the only audio stream
    ReplaceAudio,
    /// Clip audio and voice summed after independent gain
    Mix,
}

/// Choose the path; a zero original volume never mixes
pub fn plan_mix(video_has_audio: bool, voice_available: bool, original_volume: f32) -> MixPlan {
    if !voice_available {
        MixPlan::KeepExisting
    } else if original_volume <= 0.0 || !video_has_audio {
        MixPlan::ReplaceAudio
    } else {
        MixPlan::Mix
    }
}

/// Shortest exact decimal; any positive gain stays positive
fn gain(value: f32) -> String {
    format!("{}", value)
}

/// Voice replaces whatever audio the video carried; video is stream-copied
pub fn build_replace_command(
    video: &Path,
    voice: &Path,
    voice_volume: f32,
    output: &Path,
) -> EngineCommand {
    let mut cmd = EngineCommand::new();
    cmd.arg("-i").arg(video).arg("-i").arg(voice);
    cmd.args(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy"]);
    if (voice_volume - 1.0).abs() > f32::EPSILON {
        cmd.arg("-af").arg(format!("volume={}", gain(voice_volume)));
    }
    cmd.args(["-c:a", "aac", "-movflags", "+faststart"]).arg(output);
    cmd
}

/// Weighted sum of both tracks; runs as long as the longer input, clip audio is not looped
pub fn build_mix_command(
    video: &Path,
    voice: &Path,
    original_volume: f32,
    voice_volume: f32,
    output: &Path,
) -> EngineCommand {
    let graph = format!(
        "[0:a]volume={}[a0];[1:a]volume={}[a1];\
         [a0][a1]amix=inputs=2:duration=longest:dropout_transition=0:normalize=0[aout]",
        gain(original_volume),
        gain(voice_volume)
    );

    let mut cmd = EngineCommand::new();
    cmd.arg("-i").arg(video).arg("-i").arg(voice);
    cmd.arg("-filter_complex").arg(graph);
    cmd.args([
        "-map",
        "0:v:0",
        "-map",
        "[aout]",
        "-c:v",
        "copy",
        "-c:a",
        "aac",
        "-movflags",
        "+faststart",
    ])
    .arg(output);
    cmd
}

pub struct AudioMixer<'a> {
    engine: &'a dyn MediaEngine,
}

impl<'a> AudioMixer<'a> {
    pub fn new(engine: &'a dyn MediaEngine) -> Self {
        Self { engine }
    }

    /// Combine `video` with `voice` into `output`
    ///
    /// A missing voice track is not an error: the video is written out with
    /// its existing audio.
    pub fn mix(
        &self,
        video: &ConcatenatedClip,
        voice: Option<&Path>,
        original_volume: f32,
        voice_volume: f32,
        output: &Path,
    ) -> Result<AssemblyResult, AssemblyError> {
        let voice = match voice {
            Some(path) if path.is_file() => Some(path),
            Some(path) => {
                tracing::warn!(voice = %path.display(), "voice track missing, keeping clip audio");
                None
            }
            None => {
                tracing::warn!("no voice track supplied, keeping clip audio");
                None
            }
        };

        let plan = plan_mix(video.has_audio, voice.is_some(), original_volume);
        tracing::debug!(plan = ?plan, original_volume, voice_volume, "mixing audio");

        let cmd = match (plan, voice) {
            (MixPlan::ReplaceAudio, Some(voice)) => {
                build_replace_command(&video.path, voice, voice_volume, output)
            }
            (MixPlan::Mix, Some(voice)) => {
                build_mix_command(&video.path, voice, original_volume, voice_volume, output)
            }
            _ => {
                std::fs::copy(&video.path, output).map_err(AssemblyError::io(Stage::Mix))?;
                return Ok(AssemblyResult {
                    path: output.to_path_buf(),
                    duration_secs: video.duration_secs,
                });
            }
        };

        let input = voice.unwrap_or(video.path.as_path());
        self.engine
            .run(&cmd)
            .map_err(|e| AssemblyError::encode(Stage::Mix, input, e))?;

        let duration_secs = self
            .engine
            .probe(output)
            .ok()
            .and_then(|info| info.duration_secs)
            .unwrap_or(video.duration_secs);

        Ok(AssemblyResult {
            path: output.to_path_buf(),
            duration_secs,
        })
    }
}

//! Clip normalization
//!
//! Converts one source clip into the canonical form every later stage relies
//! on: target canvas size, square pixels, constant frame rate, a presentation
//! timeline starting at zero and a uniform audio layout. Results are served
//! from and stored into the shared [`ClipCache`].

use crate::cache::ClipCache;
use crate::clip::{CacheKey, NormalizationSpec, NormalizedClip, OutputProfile, SourceClip};
use crate::config::{AudioMode, CropMode};
use crate::engine::{EngineCommand, MediaEngine};
use crate::error::{AssemblyError, Stage};
use crate::probe::MediaInfo;
use std::path::Path;

/// Timescale shared by every intermediate file so streams join without retiming
pub const VIDEO_TRACK_TIMESCALE: &str = "90000";

/// Crop actually applied, after falling back for missing geometry
pub fn effective_crop(mode: CropMode, dimensions: Option<(u32, u32)>) -> CropMode {
    match (mode, dimensions) {
        (CropMode::Smart, None) => CropMode::Center,
        (mode, _) => mode,
    }
}

/// Scale-to-cover followed by a crop window onto `width`x`height`
pub fn crop_filter(spec: &NormalizationSpec, dimensions: Option<(u32, u32)>) -> String {
    let (w, h) = (spec.width, spec.height);
    let scale = format!("scale={}:{}:force_original_aspect_ratio=increase", w, h);

    let crop = match effective_crop(spec.crop_mode, dimensions) {
        CropMode::Center => format!("crop={}:{}", w, h),
        CropMode::Top => format!("crop={w}:{h}:(iw-{w})/2:0"),
        CropMode::Bottom => format!("crop={w}:{h}:(iw-{w})/2:ih-{h}"),
        CropMode::Smart => {
            let (sw, sh) = dimensions.unwrap_or((w, h));
            // source relatively taller than the canvas: subjects sit high, keep the upper third
            if (sw as u64) * (h as u64) < (w as u64) * (sh as u64) {
                format!("crop={w}:{h}:(iw-{w})/2:(ih-{h})/3")
            } else {
                format!("crop={}:{}", w, h)
            }
        }
    };

    format!("{},{}", scale, crop)
}

/// Full engine invocation for one normalization
pub fn build_normalize_command(
    input: &Path,
    info: &MediaInfo,
    spec: &NormalizationSpec,
    profile: &OutputProfile,
    output: &Path,
) -> EngineCommand {
    let synth_silence = match spec.audio_mode {
        AudioMode::Strip => false,
        AudioMode::Keep => !info.has_audio(),
        AudioMode::AddSilent => true,
    };

    let mut cmd = EngineCommand::new();
    cmd.arg("-i").arg(input);
    if synth_silence {
        cmd.args(["-f", "lavfi", "-i"]).arg(format!(
            "anullsrc=channel_layout={}:sample_rate={}",
            profile.channel_layout(),
            profile.sample_rate
        ));
    }

    // The demuxer shifts every stream by the same container start offset, so
    // streams keep their relative alignment. A stream that starts late is
    // filled from zero: duplicated first frames for video, silence for audio.
    let video_filter = format!(
        "{},setsar=1,fps={}:start_time=0,format=yuv420p",
        crop_filter(spec, info.dimensions()),
        profile.fps
    );
    cmd.args(["-map", "0:v:0", "-vf"]).arg(video_filter);
    cmd.args(profile.encoder.video_args());

    match spec.audio_mode {
        AudioMode::Strip => {
            cmd.arg("-an");
        }
        _ if synth_silence => {
            // the silent input is infinite; the video decides the length
            cmd.args(["-map", "1:a:0", "-shortest"]);
        }
        _ => {
            cmd.args(["-map", "0:a:0", "-af"]).arg(format!(
                "aresample={}:async=1:first_pts=0,aformat=channel_layouts={}",
                profile.sample_rate,
                profile.channel_layout()
            ));
        }
    }
    if spec.produces_audio() {
        cmd.args(["-c:a", "aac", "-ar"])
            .arg(profile.sample_rate.to_string())
            .arg("-ac")
            .arg(profile.channels.to_string());
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

/// Cache-backed normalizer
pub struct ClipNormalizer<'a> {
    engine: &'a dyn MediaEngine,
    cache: &'a ClipCache,
    profile: &'a OutputProfile,
}

impl<'a> ClipNormalizer<'a> {
    pub fn new(engine: &'a dyn MediaEngine, cache: &'a ClipCache, profile: &'a OutputProfile) -> Self {
        Self {
            engine,
            cache,
            profile,
        }
    }

    /// Normalize `clip` under `spec`, writing to `output` on a cache miss
    ///
    /// `output` must be run-scoped. When the result cannot be stored in the
    /// cache the run-scoped file is returned instead.
    pub fn normalize(
        &self,
        clip: &SourceClip,
        spec: &NormalizationSpec,
        output: &Path,
    ) -> Result<NormalizedClip, AssemblyError> {
        let key = CacheKey::derive(clip, spec, self.profile);

        if let Some(cached) = self.cache.lookup(&key) {
            return Ok(NormalizedClip {
                source: clip.path().to_path_buf(),
                path: cached,
                spec: *spec,
                from_cache: true,
            });
        }

        let info = self
            .engine
            .probe(clip.path())
            .map_err(|e| AssemblyError::DecodeFailure {
                path: clip.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        if info.video.is_none() {
            return Err(AssemblyError::DecodeFailure {
                path: clip.path().to_path_buf(),
                reason: "no video stream".to_string(),
            });
        }
        if spec.crop_mode == CropMode::Smart && info.dimensions().is_none() {
            tracing::debug!(clip = %clip.path().display(), "no geometry for smart crop, centering");
        }

        let cmd = build_normalize_command(clip.path(), &info, spec, self.profile, output);
        self.engine
            .run(&cmd)
            .map_err(|e| AssemblyError::encode(Stage::Normalize, clip.path(), e))?;

        let path = match self.cache.store(&key, output) {
            Ok(stored) => stored,
            Err(e) => {
                if self.cache.is_enabled() {
                    tracing::warn!(key = %key, error = %e, "could not cache normalized clip");
                }
                output.to_path_buf()
            }
        };

        Ok(NormalizedClip {
            source: clip.path().to_path_buf(),
            path,
            spec: *spec,
            from_cache: false,
        })
    }
}

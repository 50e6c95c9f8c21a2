//! Assembly runs
//!
//! One run takes an immutable [`AssemblyRequest`] through
//! normalize -> trim -> concatenate -> mix inside its own [`RunWorkspace`],
//! then moves the result to the requested output path. The cancellation flag
//! is checked before every stage and before every clip within a stage. The
//! workspace is removed however the run ends; shared cache entries are never
//! touched.

use crate::cache::{move_file, ClipCache};
use crate::clip::{AssemblyResult, NormalizationSpec, OutputProfile, SourceClip, TimelineEntry};
use crate::concat::Concatenator;
use crate::config::{AudioMode, Config, CropMode, TrimPolicy};
use crate::engine::MediaEngine;
use crate::error::{AssemblyError, Stage};
use crate::mix::AudioMixer;
use crate::normalize::ClipNormalizer;
use crate::trim::{select_trim_mode, DurationTrimmer};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Cooperative cancellation shared between a run and whoever may abort it
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run knobs, snapshotted from configuration when the run is created
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblySettings {
    pub width: u32,
    pub height: u32,
    pub crop_mode: CropMode,
    /// Configured audio mode, before the mix settings are taken into account
    pub audio_mode: AudioMode,
    pub original_volume: f32,
    pub voice_volume: f32,
    pub trim_policy: TrimPolicy,
    pub tolerance: Duration,
}

impl AssemblySettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            width: cfg.canvas.width,
            height: cfg.canvas.height,
            crop_mode: cfg.canvas.crop_mode,
            audio_mode: cfg.audio.mode,
            original_volume: cfg.mix.original_volume,
            voice_volume: cfg.mix.voice_volume,
            trim_policy: cfg.trim.policy,
            tolerance: Duration::from_millis(cfg.trim.tolerance_ms),
        }
    }

    /// Apply per-run volume overrides
    pub fn with_volumes(mut self, original: Option<f32>, voice: Option<f32>) -> Self {
        if let Some(original) = original {
            self.original_volume = original;
        }
        if let Some(voice) = voice {
            self.voice_volume = voice;
        }
        self
    }

    /// Audio mode clips are normalized with
    ///
    /// Clip audio that the mix discards is stripped up front; clip audio the
    /// mix needs is never stripped.
    pub fn effective_audio_mode(&self) -> AudioMode {
        if self.original_volume <= 0.0 {
            AudioMode::Strip
        } else if self.audio_mode == AudioMode::Strip {
            AudioMode::Keep
        } else {
            self.audio_mode
        }
    }

    pub fn normalization_spec(&self) -> NormalizationSpec {
        NormalizationSpec {
            width: self.width,
            height: self.height,
            crop_mode: self.crop_mode,
            audio_mode: self.effective_audio_mode(),
        }
    }
}

/// One slot of a requested timeline
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRequest {
    pub path: PathBuf,
    pub duration: Duration,
}

/// Immutable snapshot of everything one run needs
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyRequest {
    pub run_id: String,
    pub clips: Vec<ClipRequest>,
    pub voice: Option<PathBuf>,
    pub output: PathBuf,
    pub settings: AssemblySettings,
}

/// Run-scoped scratch directory, removed on drop
#[derive(Debug)]
pub struct RunWorkspace {
    dir: TempDir,
}

impl RunWorkspace {
    /// Create `<work_dir>/runs/run-<id>-<random>`
    pub fn create(work_dir: &Path, run_id: &str) -> io::Result<Self> {
        let runs = work_dir.join("runs");
        std::fs::create_dir_all(&runs)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("run-{}-", run_id))
            .tempdir_in(&runs)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Progress events emitted while a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    StageStarted(Stage),
    ClipNormalized { from_cache: bool },
}

fn checkpoint(cancel: &CancelFlag, before: Stage) -> Result<(), AssemblyError> {
    if cancel.is_cancelled() {
        tracing::info!(before = %before, "run cancelled");
        return Err(AssemblyError::Cancelled { before });
    }
    Ok(())
}

/// Executes assembly runs against one engine and one shared cache
pub struct Assembler {
    engine: Arc<dyn MediaEngine>,
    cache: Arc<ClipCache>,
    profile: OutputProfile,
    work_dir: PathBuf,
}

impl Assembler {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        cache: Arc<ClipCache>,
        profile: OutputProfile,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            cache,
            profile,
            work_dir: work_dir.into(),
        }
    }

    pub fn profile(&self) -> &OutputProfile {
        &self.profile
    }

    pub fn cache(&self) -> &ClipCache {
        &self.cache
    }

    pub fn assemble(
        &self,
        request: &AssemblyRequest,
        cancel: &CancelFlag,
    ) -> Result<AssemblyResult, AssemblyError> {
        self.assemble_with(request, cancel, &|_| {})
    }

    /// Run the pipeline, reporting progress to `observer`
    pub fn assemble_with(
        &self,
        request: &AssemblyRequest,
        cancel: &CancelFlag,
        observer: &dyn Fn(Progress),
    ) -> Result<AssemblyResult, AssemblyError> {
        let span = tracing::info_span!("run", run_id = %request.run_id);
        let _enter = span.enter();

        if request.clips.is_empty() {
            return Err(AssemblyError::EmptyTimeline);
        }

        let stage = |stage: Stage| -> Result<(), AssemblyError> {
            checkpoint(cancel, stage)?;
            tracing::info!(stage = %stage, clips = request.clips.len(), "stage started");
            observer(Progress::StageStarted(stage));
            Ok(())
        };

        stage(Stage::Normalize)?;
        let workspace = RunWorkspace::create(&self.work_dir, &request.run_id)
            .map_err(AssemblyError::io(Stage::Normalize))?;
        let engine = self.engine.as_ref();
        let settings = &request.settings;
        let spec = settings.normalization_spec();

        let normalizer = ClipNormalizer::new(engine, &self.cache, &self.profile);
        let mut timeline = Vec::with_capacity(request.clips.len());
        for (index, clip) in request.clips.iter().enumerate() {
            checkpoint(cancel, Stage::Normalize)?;
            let source =
                SourceClip::from_path(&clip.path).map_err(|e| AssemblyError::DecodeFailure {
                    path: clip.path.clone(),
                    reason: e.to_string(),
                })?;
            let normalized = normalizer.normalize(
                &source,
                &spec,
                &workspace.file(&format!("norm-{:03}.mp4", index)),
            )?;
            observer(Progress::ClipNormalized {
                from_cache: normalized.from_cache,
            });
            timeline.push(TimelineEntry {
                clip: normalized,
                duration: clip.duration,
            });
        }

        stage(Stage::Trim)?;
        // every clip lands on a fixed timeline, so every cut needs sync
        let trimmer = DurationTrimmer::new(
            engine,
            &self.profile,
            select_trim_mode(settings.trim_policy, true),
            settings.tolerance,
        );
        let mut trimmed = Vec::with_capacity(timeline.len());
        for (index, entry) in timeline.iter().enumerate() {
            checkpoint(cancel, Stage::Trim)?;
            trimmed.push(trimmer.trim(
                &entry.clip,
                entry.duration,
                &workspace.file(&format!("trim-{:03}.mp4", index)),
            )?);
        }

        stage(Stage::Concatenate)?;
        let joined = Concatenator::new(engine).concatenate(&trimmed, &workspace.file("concat.mp4"))?;

        stage(Stage::Mix)?;
        let mixed = AudioMixer::new(engine).mix(
            &joined,
            request.voice.as_deref(),
            settings.original_volume,
            settings.voice_volume,
            &workspace.file("mixed.mp4"),
        )?;

        stage(Stage::Finalize)?;
        if let Some(parent) = request.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(AssemblyError::io(Stage::Finalize))?;
        }
        move_file(&mixed.path, &request.output).map_err(AssemblyError::io(Stage::Finalize))?;

        let requested: f64 = request.clips.iter().map(|c| c.duration.as_secs_f64()).sum();
        tracing::info!(
            output = %request.output.display(),
            requested,
            realized = mixed.duration_secs,
            "run complete"
        );

        Ok(AssemblyResult {
            path: request.output.clone(),
            duration_secs: mixed.duration_secs,
        })
    }
}

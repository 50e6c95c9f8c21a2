//! Run manifests
//!
//! A manifest is the JSON snapshot a record store hands over for one run: the
//! ordered clips with their durations, an optional voice track and the output
//! path. Relative paths resolve against the manifest's own directory.
//!
//! ```json
//! {
//!   "id": "spring-promo",
//!   "clips": [
//!     { "path": "clips/intro.mov", "duration_secs": 2.5 },
//!     { "path": "clips/product.mp4", "duration_secs": 4.0 }
//!   ],
//!   "voice": "voice/take3.m4a",
//!   "output": "out/spring-promo.mp4",
//!   "original_volume": 0.3
//! }
//! ```

use crate::pipeline::{AssemblyRequest, AssemblySettings, ClipRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
pub enum ManifestError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Io(e) => write!(f, "IO error: {}", e),
            ManifestError::Parse(e) => write!(f, "Parse error: {}", e),
            ManifestError::Invalid(msg) => write!(f, "Invalid manifest: {}", msg),
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<std::io::Error> for ManifestError {
    fn from(e: std::io::Error) -> Self {
        ManifestError::Io(e)
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        ManifestError::Parse(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestClip {
    pub path: PathBuf,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run identifier; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub clips: Vec<ManifestClip>,
    #[serde(default)]
    pub voice: Option<PathBuf>,
    pub output: PathBuf,
    #[serde(default)]
    pub original_volume: Option<f32>,
    #[serde(default)]
    pub voice_volume: Option<f32>,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn clip_duration(clip: &ManifestClip) -> Option<Duration> {
    if clip.duration_secs > 0.0 {
        Duration::try_from_secs_f64(clip.duration_secs).ok()
    } else {
        None
    }
}

fn valid_volume(value: Option<f32>) -> bool {
    value.map_or(true, |v| v.is_finite() && v >= 0.0)
}

impl RunManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        let manifest: RunManifest = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.clips.is_empty() {
            return Err(ManifestError::Invalid("no clips".to_string()));
        }
        if let Some((index, clip)) = self
            .clips
            .iter()
            .enumerate()
            .find(|(_, c)| clip_duration(c).is_none())
        {
            return Err(ManifestError::Invalid(format!(
                "clip {} ({}) has invalid duration {}",
                index,
                clip.path.display(),
                clip.duration_secs
            )));
        }
        if !valid_volume(self.original_volume) || !valid_volume(self.voice_volume) {
            return Err(ManifestError::Invalid(
                "volumes must be finite and non-negative".to_string(),
            ));
        }
        if let Some(id) = &self.id {
            if id.is_empty() || id.contains(['/', '\\']) {
                return Err(ManifestError::Invalid(format!("unusable run id '{}'", id)));
            }
        }
        Ok(())
    }

    /// Freeze into a run request, resolving relative paths against `base_dir`
    pub fn into_request(
        self,
        base_dir: &Path,
        defaults: &AssemblySettings,
    ) -> Result<AssemblyRequest, ManifestError> {
        self.validate()?;
        let clips = self
            .clips
            .iter()
            .map(|c| {
                clip_duration(c)
                    .map(|duration| ClipRequest {
                        path: resolve(base_dir, &c.path),
                        duration,
                    })
                    .ok_or_else(|| {
                        ManifestError::Invalid(format!("unusable duration {}", c.duration_secs))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AssemblyRequest {
            run_id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            clips,
            voice: self.voice.as_deref().map(|v| resolve(base_dir, v)),
            output: resolve(base_dir, &self.output),
            settings: defaults
                .clone()
                .with_volumes(self.original_volume, self.voice_volume),
        })
    }
}

/// Load a manifest file and turn it into a request
pub fn load_request(path: &Path, defaults: &AssemblySettings) -> Result<AssemblyRequest, ManifestError> {
    let manifest = RunManifest::load(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    manifest.into_request(base_dir, defaults)
}

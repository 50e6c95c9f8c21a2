//! Clip identities, normalization requests and cache keys

use crate::config::{AudioMode, CropMode};
use crate::encoder::EncoderDescriptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Version of the cache key scheme. Bump whenever the way clips are encoded
/// changes in a way the other key inputs do not capture.
pub const CACHE_KEY_VERSION: u32 = 1;

/// Immutable reference to a source clip
///
/// Identity is (absolute path, modification time); the bytes are never read to
/// detect changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceClip {
    path: PathBuf,
    modified: SystemTime,
}

impl SourceClip {
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }

    /// Resolve a path on disk into an absolute identity
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let absolute = path.canonicalize()?;
        let modified = std::fs::metadata(&absolute)?.modified()?;
        Ok(Self::new(absolute, modified))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    fn modified_nanos(&self) -> u128 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    }
}

/// Canonical form requested for a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizationSpec {
    pub width: u32,
    pub height: u32,
    pub crop_mode: CropMode,
    pub audio_mode: AudioMode,
}

impl NormalizationSpec {
    /// Whether clips normalized under this spec carry an audio stream
    pub fn produces_audio(&self) -> bool {
        self.audio_mode != AudioMode::Strip
    }
}

/// Encoding parameters shared by every normalized clip of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProfile {
    pub encoder: EncoderDescriptor,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl OutputProfile {
    pub fn from_config(cfg: &crate::config::Config, encoder: EncoderDescriptor) -> Self {
        Self {
            encoder,
            fps: cfg.canvas.fps,
            sample_rate: cfg.audio.sample_rate,
            channels: cfg.audio.channels,
        }
    }

    /// ffmpeg channel layout name
    pub fn channel_layout(&self) -> &'static str {
        if self.channels == 1 {
            "mono"
        } else {
            "stereo"
        }
    }
}

/// Deterministic content address of a normalization result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash the clip identity, the spec and the encoding profile
    pub fn derive(clip: &SourceClip, spec: &NormalizationSpec, profile: &OutputProfile) -> Self {
        let material = format!(
            "v{}\npath={}\nmtime={}\nsize={}x{}\ncrop={}\naudio={}\nencoder={}\nfps={}\nar={}\nac={}",
            CACHE_KEY_VERSION,
            clip.path().display(),
            clip.modified_nanos(),
            spec.width,
            spec.height,
            spec.crop_mode.as_str(),
            spec.audio_mode.as_str(),
            profile.encoder.fingerprint(),
            profile.fps,
            profile.sample_rate,
            profile.channels,
        );

        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Media file name inside the cache root
    pub fn file_name(&self) -> String {
        format!("{}.mp4", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of the normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClip {
    pub source: PathBuf,
    pub path: PathBuf,
    pub spec: NormalizationSpec,
    /// Served from the cache without an engine invocation
    pub from_cache: bool,
}

impl NormalizedClip {
    pub fn has_audio(&self) -> bool {
        self.spec.produces_audio()
    }
}

/// One slot of the output timeline
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub clip: NormalizedClip,
    pub duration: Duration,
}

/// A normalized clip cut to its requested duration
#[derive(Debug, Clone, PartialEq)]
pub struct TrimmedClip {
    pub path: PathBuf,
    /// Source clip the cut was made from
    pub source: PathBuf,
    pub requested: Duration,
    /// Player-reported length, when it could be probed
    pub realized_secs: Option<f64>,
    pub has_audio: bool,
}

/// The joined timeline, before audio mixing
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatenatedClip {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub has_audio: bool,
}

/// Final output of one assembly run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyResult {
    pub path: PathBuf,
    /// Realized total length; may differ slightly from the requested sum
    pub duration_secs: f64,
}

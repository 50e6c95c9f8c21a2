//! Stream-level concatenation of trimmed clips
//!
//! Joins with the concat demuxer and `-c copy`. Boundary timestamps are exact
//! by construction, so nothing is retimed here; a sequence whose streams
//! differ is rejected instead of joined.

use crate::clip::{ConcatenatedClip, TrimmedClip};
use crate::engine::{EngineCommand, MediaEngine};
use crate::error::{AssemblyError, Stage};
use crate::probe::MediaInfo;
use std::fmt;
use std::path::{Path, PathBuf};

/// Audio half of a [`StreamLayout`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioLayout {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
}

/// Structural properties that must match across a concatenated sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLayout {
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    pub audio: Option<AudioLayout>,
}

impl StreamLayout {
    pub fn from_info(info: &MediaInfo) -> Option<Self> {
        let video = info.video.as_ref()?;
        Some(Self {
            width: video.width,
            height: video.height,
            video_codec: video.codec_name.clone(),
            audio: info.audio.as_ref().map(|a| AudioLayout {
                codec: a.codec_name.clone(),
                channels: a.channels,
                sample_rate: a.sample_rate,
            }),
        })
    }

    /// First mismatch against `expected`, described for the error report
    pub fn mismatch(&self, expected: &StreamLayout) -> Option<String> {
        if (self.width, self.height) != (expected.width, expected.height) {
            return Some(format!(
                "resolution {}x{} != {}x{}",
                self.width, self.height, expected.width, expected.height
            ));
        }
        if self.video_codec != expected.video_codec {
            return Some(format!(
                "video codec {} != {}",
                self.video_codec, expected.video_codec
            ));
        }
        match (&self.audio, &expected.audio) {
            (None, None) => None,
            (Some(_), None) => Some("has audio, sequence is silent".to_string()),
            (None, Some(_)) => Some("missing audio stream".to_string()),
            (Some(a), Some(b)) if a != b => Some(format!("audio {} != {}", a, b)),
            _ => None,
        }
    }
}

impl fmt::Display for AudioLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}ch", self.codec, self.channels)?;
        if let Some(rate) = self.sample_rate {
            write!(f, " {}Hz", rate)?;
        }
        Ok(())
    }
}

/// Check that every layout matches the first
///
/// `Err` holds the index of the first offending element and the reason. An
/// element whose layout could not be determined is itself incompatible.
pub fn check_compatible(layouts: &[Result<StreamLayout, String>]) -> Result<(), (usize, String)> {
    let mut expected: Option<&StreamLayout> = None;

    for (index, layout) in layouts.iter().enumerate() {
        let layout = layout.as_ref().map_err(|reason| (index, reason.clone()))?;
        match expected {
            None => expected = Some(layout),
            Some(first) => {
                if let Some(reason) = layout.mismatch(first) {
                    return Err((index, reason));
                }
            }
        }
    }
    Ok(())
}

/// Concat demuxer list file body
pub fn concat_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

pub fn build_concat_command(list: &Path, output: &Path) -> EngineCommand {
    let mut cmd = EngineCommand::new();
    cmd.args(["-f", "concat", "-safe", "0", "-i"])
        .arg(list)
        .args(["-map", "0", "-c", "copy", "-movflags", "+faststart"])
        .arg(output);
    cmd
}

pub struct Concatenator<'a> {
    engine: &'a dyn MediaEngine,
}

impl<'a> Concatenator<'a> {
    pub fn new(engine: &'a dyn MediaEngine) -> Self {
        Self { engine }
    }

    /// Join `sequence` into `output`; the demuxer list is written beside it
    pub fn concatenate(
        &self,
        sequence: &[TrimmedClip],
        output: &Path,
    ) -> Result<ConcatenatedClip, AssemblyError> {
        if sequence.is_empty() {
            return Err(AssemblyError::EmptyTimeline);
        }

        let layouts: Vec<Result<StreamLayout, String>> = sequence
            .iter()
            .map(|clip| {
                self.engine
                    .probe(&clip.path)
                    .map_err(|e| format!("cannot probe {}: {}", clip.path.display(), e))
                    .and_then(|info| {
                        StreamLayout::from_info(&info)
                            .ok_or_else(|| "no video stream".to_string())
                    })
            })
            .collect();

        if let Err((index, reason)) = check_compatible(&layouts) {
            tracing::error!(index, %reason, "refusing to concatenate incompatible sequence");
            return Err(AssemblyError::IncompatibleSequence {
                index,
                input: sequence[index].source.clone(),
                reason,
            });
        }

        let paths: Vec<PathBuf> = sequence.iter().map(|c| c.path.clone()).collect();
        let list = output.with_extension("txt");
        std::fs::write(&list, concat_list(&paths)).map_err(AssemblyError::io(Stage::Concatenate))?;

        self.engine
            .run(&build_concat_command(&list, output))
            .map_err(|e| AssemblyError::encode(Stage::Concatenate, &list, e))?;

        let expected: f64 = sequence
            .iter()
            .map(|c| c.realized_secs.unwrap_or_else(|| c.requested.as_secs_f64()))
            .sum();
        let duration_secs = self
            .engine
            .probe(output)
            .ok()
            .and_then(|info| info.duration_secs)
            .unwrap_or(expected);

        tracing::debug!(clips = sequence.len(), duration_secs, "concatenated timeline");

        Ok(ConcatenatedClip {
            path: output.to_path_buf(),
            duration_secs,
            has_audio: sequence[0].has_audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{sample_info, FakeEngine};
    use std::time::Duration;
    use tempfile::TempDir;

    fn layout(width: u32, height: u32, audio: bool) -> StreamLayout {
        StreamLayout {
            width,
            height,
            video_codec: "h264".to_string(),
            audio: audio.then(|| AudioLayout {
                codec: "aac".to_string(),
                channels: 2,
                sample_rate: Some(44100),
            }),
        }
    }

    fn trimmed(dir: &Path, n: usize, secs: u64) -> TrimmedClip {
        let path = dir.join(format!("trim-{:03}.mp4", n));
        std::fs::write(&path, b"trimmed").unwrap();
        TrimmedClip {
            path,
            source: dir.join(format!("source-{}.mov", n)),
            requested: Duration::from_secs(secs),
            realized_secs: None,
            has_audio: true,
        }
    }

    #[test]
    fn test_compatible_sequence() {
        let layouts: Vec<Result<StreamLayout, String>> = vec![Ok(layout(1080, 1920, true)); 5];
        assert_eq!(check_compatible(&layouts), Ok(()));
        assert_eq!(check_compatible(&[]), Ok(()));
    }

    #[test]
    fn test_rejects_resolution_mismatch() {
        let layouts: Vec<Result<StreamLayout, String>> = vec![
            Ok(layout(1080, 1920, true)),
            Ok(layout(1080, 1920, true)),
            Ok(layout(720, 1280, true)),
        ];
        let (index, reason) = check_compatible(&layouts).unwrap_err();
        assert_eq!(index, 2);
        assert!(reason.contains("720x1280"));
    }

    #[test]
    fn test_rejects_audio_presence_mismatch() {
        let layouts: Vec<Result<StreamLayout, String>> =
            vec![Ok(layout(1080, 1920, true)), Ok(layout(1080, 1920, false))];
        let (index, reason) = check_compatible(&layouts).unwrap_err();
        assert_eq!(index, 1);
        assert_eq!(reason, "missing audio stream");
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let mut mono = layout(1080, 1920, true);
        if let Some(audio) = mono.audio.as_mut() {
            audio.channels = 1;
        }
        let layouts: Vec<Result<StreamLayout, String>> = vec![Ok(layout(1080, 1920, true)), Ok(mono)];
        let (_, reason) = check_compatible(&layouts).unwrap_err();
        assert!(reason.contains("1ch"));
    }

    #[test]
    fn test_unprobeable_element_is_incompatible() {
        let layouts = vec![Ok(layout(1080, 1920, true)), Err("cannot probe".to_string())];
        assert_eq!(
            check_compatible(&layouts),
            Err((1, "cannot probe".to_string()))
        );
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&[
            PathBuf::from("/work/trim-000.mp4"),
            PathBuf::from("/work/it's.mp4"),
        ]);
        assert_eq!(
            list,
            "file '/work/trim-000.mp4'\nfile '/work/it'\\''s.mp4'\n"
        );
    }

    #[test]
    fn test_concatenate_writes_list_and_copies_streams() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let sequence: Vec<_> = (0..3).map(|n| trimmed(dir.path(), n, 4)).collect();
        let output = dir.path().join("concat.mp4");
        engine.set_probe(&output, sample_info(true, 12.04));

        let joined = Concatenator::new(&engine)
            .concatenate(&sequence, &output)
            .unwrap();

        assert_eq!(joined.duration_secs, 12.04);
        assert!(joined.has_audio);
        let list = std::fs::read_to_string(dir.path().join("concat.txt")).unwrap();
        assert_eq!(list.lines().count(), 3);

        let args = engine.calls()[0].to_strings();
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
    }

    #[test]
    fn test_concatenate_rejects_incompatible_without_invoking_engine() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let sequence: Vec<_> = (0..3).map(|n| trimmed(dir.path(), n, 2)).collect();
        let mut odd = sample_info(true, 2.0);
        if let Some(video) = odd.video.as_mut() {
            video.width = 720;
            video.height = 1280;
        }
        engine.set_probe(&sequence[1].path, odd);

        let err = Concatenator::new(&engine)
            .concatenate(&sequence, &dir.path().join("concat.mp4"))
            .unwrap_err();

        assert!(matches!(err, AssemblyError::IncompatibleSequence { index: 1, .. }));
        assert_eq!(err.input(), Some(dir.path().join("source-1.mov").as_path()));
        assert_eq!(engine.call_count(), 0);
    }

    #[test]
    fn test_unprobeable_output_falls_back_to_realized_lengths() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let mut sequence: Vec<_> = (0..3).map(|n| trimmed(dir.path(), n, 3)).collect();
        sequence[0].realized_secs = Some(3.04);
        sequence[1].realized_secs = Some(2.97);
        let output = dir.path().join("concat.mp4");
        engine.mark_unreadable(&output);

        let joined = Concatenator::new(&engine)
            .concatenate(&sequence, &output)
            .unwrap();

        // the unprobed third clip counts at its requested length
        assert!((joined.duration_secs - 9.01).abs() < 1e-9);
    }

    #[test]
    fn test_empty_sequence() {
        let dir = TempDir::new().unwrap();
        let engine = FakeEngine::new();
        let err = Concatenator::new(&engine)
            .concatenate(&[], &dir.path().join("concat.mp4"))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::EmptyTimeline));
    }
}

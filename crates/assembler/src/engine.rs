//! Transcoding engine invocation
//!
//! Every stage talks to the external engine through [`MediaEngine`]: a
//! synchronous, argument-list-driven subprocess call plus a metadata probe.
//! Commands are built as plain [`EngineCommand`] values so the argument lists
//! can be inspected without spawning anything.

use crate::probe::{probe_file, MediaInfo, ProbeError};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Error type for engine invocations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine exited with non-zero status; stderr is kept verbatim
    #[error("engine exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// Engine process was terminated by a signal
    #[error("engine was terminated by signal: {stderr}")]
    Terminated { stderr: String },

    /// Engine could not be launched
    #[error("failed to launch engine: {0}")]
    Io(#[from] std::io::Error),
}

/// Argument list for one engine invocation, output path last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    args: Vec<OsString>,
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineCommand {
    /// Start a command with the flags every invocation shares
    pub fn new() -> Self {
        let mut cmd = Self { args: Vec::new() };
        cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]);
        cmd
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The output path, by convention the final argument
    pub fn output_path(&self) -> Option<&Path> {
        self.args.last().map(Path::new)
    }

    /// Lossy string form of the arguments, for logs and assertions
    pub fn to_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// Seam between the pipeline and the external transcoding engine
pub trait MediaEngine: Send + Sync {
    /// Run one invocation to completion
    fn run(&self, cmd: &EngineCommand) -> Result<(), EngineError>;

    /// Read stream and format metadata of a media file
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;

    /// Engine name for logs
    fn name(&self) -> &str;
}

/// ffmpeg/ffprobe subprocess engine
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegEngine {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_config(cfg: &crate::config::EncoderConfig) -> Self {
        Self::new(&cfg.ffmpeg, &cfg.ffprobe)
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    /// Build the process for an engine command
    pub fn to_command(&self, cmd: &EngineCommand) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(cmd.get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl MediaEngine for FfmpegEngine {
    fn run(&self, cmd: &EngineCommand) -> Result<(), EngineError> {
        tracing::debug!(args = ?cmd.to_strings(), "invoking ffmpeg");
        let output = self.to_command(cmd).output()?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(code) => Err(EngineError::Failed { code, stderr }),
            None => Err(EngineError::Terminated { stderr }),
        }
    }

    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        probe_file(&self.ffprobe, path)
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// Scripted engine used by the pipeline tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::probe::{AudioStream, VideoStream};
    use std::collections::{HashMap, HashSet};
    use std::ffi::OsString;
    use std::sync::Mutex;

    pub(crate) struct FakeEngine {
        calls: Mutex<Vec<EngineCommand>>,
        probes: Mutex<HashMap<PathBuf, MediaInfo>>,
        /// Probe answers keyed by file name; `None` fails the probe
        named: Mutex<HashMap<OsString, Option<MediaInfo>>>,
        unreadable: Mutex<HashSet<PathBuf>>,
        fail_when: Mutex<Option<String>>,
        default_info: MediaInfo,
    }

    pub(crate) fn sample_info(has_audio: bool, duration_secs: f64) -> MediaInfo {
        MediaInfo {
            video: Some(VideoStream {
                codec_name: "h264".to_string(),
                width: 1920,
                height: 1080,
                frame_rate: Some(30.0),
                pix_fmt: Some("yuv420p".to_string()),
            }),
            audio: has_audio.then(|| AudioStream {
                codec_name: "aac".to_string(),
                channels: 2,
                sample_rate: Some(44100),
            }),
            duration_secs: Some(duration_secs),
        }
    }

    impl FakeEngine {
        pub(crate) fn new() -> Self {
            Self::with_default(sample_info(true, 10.0))
        }

        pub(crate) fn with_default(default_info: MediaInfo) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                probes: Mutex::new(HashMap::new()),
                named: Mutex::new(HashMap::new()),
                unreadable: Mutex::new(HashSet::new()),
                fail_when: Mutex::new(None),
                default_info,
            }
        }

        pub(crate) fn set_probe(&self, path: &Path, info: MediaInfo) {
            self.probes.lock().unwrap().insert(path.to_path_buf(), info);
        }

        /// Script probes of files the pipeline names itself (`trim-000.mp4`)
        pub(crate) fn set_probe_by_name(&self, name: &str, info: Option<MediaInfo>) {
            self.named.lock().unwrap().insert(OsString::from(name), info);
        }

        pub(crate) fn mark_unreadable(&self, path: &Path) {
            self.unreadable.lock().unwrap().insert(path.to_path_buf());
        }

        /// Fail any command with an argument containing `needle`
        pub(crate) fn fail_when_arg_contains(&self, needle: &str) {
            *self.fail_when.lock().unwrap() = Some(needle.to_string());
        }

        pub(crate) fn calls(&self) -> Vec<EngineCommand> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl MediaEngine for FakeEngine {
        fn run(&self, cmd: &EngineCommand) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(cmd.clone());

            if let Some(needle) = self.fail_when.lock().unwrap().as_deref() {
                if cmd.to_strings().iter().any(|a| a.contains(needle)) {
                    return Err(EngineError::Failed {
                        code: 1,
                        stderr: format!("simulated failure on '{}'", needle),
                    });
                }
            }

            if let Some(output) = cmd.output_path() {
                std::fs::write(output, cmd.to_strings().join(" "))?;
            }
            Ok(())
        }

        fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
            if self.unreadable.lock().unwrap().contains(path) {
                return Err(ProbeError::FfprobeFailed(
                    "Invalid data found when processing input".to_string(),
                ));
            }
            if let Some(scripted) = path
                .file_name()
                .and_then(|name| self.named.lock().unwrap().get(name).cloned())
            {
                return scripted.ok_or_else(|| {
                    ProbeError::FfprobeFailed(format!("{}: moov atom not found", path.display()))
                });
            }
            if let Some(info) = self.probes.lock().unwrap().get(path) {
                return Ok(info.clone());
            }
            if path.exists() {
                Ok(self.default_info.clone())
            } else {
                Err(ProbeError::FfprobeFailed(format!(
                    "{}: No such file or directory",
                    path.display()
                )))
            }
        }

        fn name(&self) -> &str {
            "fake"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Strategy for generating valid path-like strings
    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("[a-zA-Z0-9_/.-]{1,50}")
            .unwrap()
            .prop_filter("non-empty path", |s| !s.is_empty())
    }

    #[test]
    fn test_new_command_has_shared_flags() {
        let cmd = EngineCommand::new();
        let args = cmd.to_strings();
        assert!(args.contains(&"-nostdin".to_string()));
        assert!(args.contains(&"-y".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-loglevel" && w[1] == "error"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_path_is_last_argument(
            input in path_strategy(),
            output in path_strategy(),
        ) {
            let mut cmd = EngineCommand::new();
            cmd.arg("-i").arg(&input).arg(&output);

            prop_assert_eq!(cmd.output_path(), Some(Path::new(&output)));
        }
    }

    #[test]
    fn test_ffmpeg_engine_command_uses_configured_binary() {
        let engine = FfmpegEngine::new("/opt/ffmpeg/bin/ffmpeg", "/opt/ffmpeg/bin/ffprobe");
        let mut cmd = EngineCommand::new();
        cmd.arg("-i").arg("in.mp4").arg("out.mp4");

        let command = engine.to_command(&cmd);
        assert_eq!(command.get_program(), OsStr::new("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(command.get_args().count(), cmd.get_args().len());
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let engine = FfmpegEngine::new("/nonexistent/ffmpeg-binary", "/nonexistent/ffprobe");
        let mut cmd = EngineCommand::new();
        cmd.arg("-version");

        let result = engine.run(&cmd);
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_failed_error_keeps_stderr_verbatim() {
        let err = EngineError::Failed {
            code: 234,
            stderr: "moov atom not found\nin.mp4: Invalid data".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("234"));
        assert!(message.contains("moov atom not found\nin.mp4: Invalid data"));
    }
}

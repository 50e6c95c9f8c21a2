//! Startup checks
//!
//! Preflight verification before any run is accepted:
//! - ffmpeg and ffprobe are runnable
//! - ffmpeg is 5.0 or newer (`amix normalize=` and `tpad` options)
//! - the cache root and work directory are writable

use crate::config::Config;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Oldest supported ffmpeg major version
pub const MIN_FFMPEG_MAJOR: u32 = 5;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    EngineUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("directory {path} is not writable: {source}")]
    NotWritable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn version_output(tool: &Path) -> Result<String, StartupError> {
    let unavailable = |reason: String| StartupError::EngineUnavailable {
        tool: tool.display().to_string(),
        reason,
    };

    let output = Command::new(tool)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(format!("is it installed and in PATH? {}", e)))?;

    if !output.status.success() {
        return Err(unavailable(format!("-version exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Verifies a tool answers `-version`
pub fn check_engine_available(tool: &Path) -> Result<(), StartupError> {
    version_output(tool).map(|_| ())
}

/// Parse the major version from `ffmpeg -version` output
///
/// Handles release strings (`ffmpeg version 6.1.1`), n-prefixed builds
/// (`ffmpeg version n7.0-...`) and distro suffixes (`4.4.2-0ubuntu0.22.04.1`).
/// Git snapshots (`N-113043-g...`) carry no major version and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let major = version_part
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?;

    major.parse().ok()
}

/// Verifies ffmpeg is runnable and new enough
pub fn check_ffmpeg_version(ffmpeg: &Path) -> Result<u32, StartupError> {
    let output = version_output(ffmpeg)?;
    let major = parse_ffmpeg_version(&output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }
    Ok(major)
}

/// Creates `dir` if needed and proves a file can be written inside it
pub fn check_writable(dir: &Path) -> Result<(), StartupError> {
    let not_writable = |source| StartupError::NotWritable {
        path: dir.display().to_string(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(not_writable)?;
    tempfile::tempfile_in(dir).map_err(not_writable)?;
    Ok(())
}

/// Runs all startup checks
pub fn run_startup_checks(cfg: &Config, work_dir: &Path) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.encoder.ffmpeg)?;
    check_engine_available(&cfg.encoder.ffprobe)?;
    check_writable(work_dir)?;
    if cfg.cache.enabled {
        check_writable(&cfg.cache.dir)?;
    }
    tracing::debug!(ffmpeg_major = major, "startup checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Any "ffmpeg version X.Y..." banner parses to X.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_parse_release_versions(
            major in 1u32..20,
            minor in 0u32..10,
            prefixed in any::<bool>(),
            suffix in "(-[a-z0-9.]{1,12})?",
        ) {
            let banner = format!(
                "ffmpeg version {}{}.{}{} Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc 13",
                if prefixed { "n" } else { "" },
                major,
                minor,
                suffix
            );
            prop_assert_eq!(parse_ffmpeg_version(&banner), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_variants() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 4.4.2-0ubuntu0.22.04.1 Copyright (c) 2000-2021"),
            Some(4)
        );
        assert_eq!(parse_ffmpeg_version("ffmpeg version n7.0-12-gabcdef"), Some(7));
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-113043-g1f3b4b5"), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_engine_reported() {
        let err = check_engine_available(Path::new("/nonexistent/ffprobe")).unwrap_err();
        assert!(matches!(err, StartupError::EngineUnavailable { .. }));
        assert!(err.to_string().contains("/nonexistent/ffprobe"));

        assert!(check_ffmpeg_version(Path::new("/nonexistent/ffmpeg")).is_err());
    }

    #[test]
    fn test_check_writable_creates_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("work/runs");
        check_writable(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_check_writable_rejects_file_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            check_writable(&file.join("sub")),
            Err(StartupError::NotWritable { .. })
        ));
    }
}

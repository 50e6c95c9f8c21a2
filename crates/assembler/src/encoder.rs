//! Encoder selection
//!
//! Probes the host for a hardware H.264 encoder in a fixed preference order and
//! falls back to libx264. A candidate counts only if ffmpeg lists it *and* a
//! one-frame trial encode succeeds: drivers are frequently missing even when
//! the encoder is compiled in.

use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Process-wide detection result; host capability does not change mid-run
static DETECTED: OnceLock<EncoderDescriptor> = OnceLock::new();

/// Whether an encoder runs on dedicated hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    Hardware,
    Software,
}

/// Codec name plus the argument template used for every encode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderDescriptor {
    /// ffmpeg encoder name (e.g. `h264_nvenc`)
    pub name: String,
    /// Output codec family
    pub codec: String,
    pub kind: EncoderKind,
    /// Quality/rate-control arguments
    pub args: Vec<String>,
}

impl EncoderDescriptor {
    /// The guaranteed fallback
    pub fn software() -> Self {
        Self::from_candidate(&SOFTWARE_FALLBACK)
    }

    fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            name: candidate.name.to_string(),
            codec: "h264".to_string(),
            kind: if candidate.hardware {
                EncoderKind::Hardware
            } else {
                EncoderKind::Software
            },
            args: candidate.args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Full video codec arguments for an output
    pub fn video_args(&self) -> Vec<String> {
        let mut args = vec!["-c:v".to_string(), self.name.clone()];
        args.extend(self.args.iter().cloned());
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
        args
    }

    /// Stable identity of everything that shapes the encoded bytes
    pub fn fingerprint(&self) -> String {
        format!("{}[{}]", self.name, self.args.join(" "))
    }
}

/// One entry of the preference list
#[derive(Debug)]
pub struct Candidate {
    pub name: &'static str,
    pub args: &'static [&'static str],
    /// Restrict to one `std::env::consts::OS`
    pub os: Option<&'static str>,
    pub hardware: bool,
}

/// Hardware encoders, most preferred first
pub const HARDWARE_CANDIDATES: &[Candidate] = &[
    Candidate {
        name: "h264_nvenc",
        args: &["-preset", "p4", "-rc", "vbr", "-cq", "23", "-b:v", "0"],
        os: None,
        hardware: true,
    },
    Candidate {
        name: "h264_qsv",
        args: &["-preset", "medium", "-global_quality", "23"],
        os: None,
        hardware: true,
    },
    Candidate {
        name: "h264_videotoolbox",
        args: &["-b:v", "8M"],
        os: Some("macos"),
        hardware: true,
    },
    Candidate {
        name: "h264_amf",
        args: &["-quality", "balanced", "-rc", "cqp", "-qp_i", "23", "-qp_p", "23"],
        os: Some("windows"),
        hardware: true,
    },
];

pub const SOFTWARE_FALLBACK: Candidate = Candidate {
    name: "libx264",
    args: &["-preset", "veryfast", "-crf", "20"],
    os: None,
    hardware: false,
};

/// Extract encoder names from `ffmpeg -encoders` output
///
/// Entries look like ` V....D h264_nvenc   NVIDIA NVENC H.264 encoder`; the
/// header above the `------` separator is ignored.
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6 && flags.starts_with(['V', 'A', 'S'])).then(|| name.to_string())
        })
        .collect()
}

/// Walk the preference list and return the first usable encoder
///
/// `verify` performs the trial encode; it is only called for candidates that
/// are listed and match the host OS.
pub fn select_encoder<F>(available: &HashSet<String>, os: &str, mut verify: F) -> EncoderDescriptor
where
    F: FnMut(&Candidate) -> bool,
{
    HARDWARE_CANDIDATES
        .iter()
        .filter(|c| c.os.map_or(true, |required| required == os))
        .filter(|c| available.contains(c.name))
        .find(|c| verify(c))
        .map(EncoderDescriptor::from_candidate)
        .unwrap_or_else(EncoderDescriptor::software)
}

/// Host capability probe
#[derive(Debug, Clone)]
pub struct EncoderSelector {
    ffmpeg: PathBuf,
    allow_hardware: bool,
}

impl EncoderSelector {
    pub fn new(ffmpeg: impl Into<PathBuf>, allow_hardware: bool) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            allow_hardware,
        }
    }

    pub fn from_config(cfg: &crate::config::EncoderConfig) -> Self {
        Self::new(&cfg.ffmpeg, cfg.allow_hardware)
    }

    /// Never fails; the first call per process does the probing
    pub fn detect(&self) -> EncoderDescriptor {
        if !self.allow_hardware {
            return EncoderDescriptor::software();
        }
        DETECTED.get_or_init(|| self.probe_host()).clone()
    }

    /// Probe without consulting the process-wide result
    pub fn probe_host(&self) -> EncoderDescriptor {
        let available = match self.list_encoders() {
            Some(listing) => parse_encoder_list(&listing),
            None => {
                tracing::warn!(ffmpeg = %self.ffmpeg.display(), "could not list encoders, using software fallback");
                return EncoderDescriptor::software();
            }
        };

        let selected = select_encoder(&available, std::env::consts::OS, |candidate| {
            let ok = self.trial_encode(candidate);
            tracing::debug!(encoder = candidate.name, ok, "trial encode");
            ok
        });

        tracing::info!(encoder = %selected.name, kind = ?selected.kind, "selected video encoder");
        selected
    }

    fn list_encoders(&self) -> Option<String> {
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn trial_encode(&self, candidate: &Candidate) -> bool {
        Command::new(&self.ffmpeg)
            .args([
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "error",
                "-f",
                "lavfi",
                "-i",
                "color=c=black:s=256x256:d=0.1",
                "-frames:v",
                "1",
                "-c:v",
                candidate.name,
                "-f",
                "null",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ENCODERS_OUTPUT: &str = "Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V..... h264_qsv             H.264 / AVC / MPEG-4 AVC (Intel Quick Sync Video acceleration) (codec h264)
 A....D aac                  AAC (Advanced Audio Coding)
";

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(ENCODERS_OUTPUT);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("h264_nvenc"));
        assert!(encoders.contains("h264_qsv"));
        assert!(encoders.contains("aac"));
        // legend lines above the separator are not encoders
        assert!(!encoders.contains("="));
        assert_eq!(encoders.len(), 4);
    }

    #[test]
    fn test_prefers_first_verified_candidate() {
        let available = names(&["h264_nvenc", "h264_qsv", "libx264"]);
        let selected = select_encoder(&available, "linux", |_| true);
        assert_eq!(selected.name, "h264_nvenc");
        assert_eq!(selected.kind, EncoderKind::Hardware);
    }

    #[test]
    fn test_skips_candidate_failing_trial() {
        let available = names(&["h264_nvenc", "h264_qsv", "libx264"]);
        let selected = select_encoder(&available, "linux", |c| c.name != "h264_nvenc");
        assert_eq!(selected.name, "h264_qsv");
    }

    #[test]
    fn test_platform_specific_candidates() {
        let available = names(&["h264_videotoolbox", "h264_amf"]);
        assert_eq!(select_encoder(&available, "linux", |_| true).name, "libx264");
        assert_eq!(
            select_encoder(&available, "macos", |_| true).name,
            "h264_videotoolbox"
        );
        assert_eq!(select_encoder(&available, "windows", |_| true).name, "h264_amf");
    }

    #[test]
    fn test_software_only_when_hardware_disallowed() {
        let selector = EncoderSelector::new("/nonexistent/ffmpeg", false);
        let selected = selector.detect();
        assert_eq!(selected, EncoderDescriptor::software());
    }

    #[test]
    fn test_unrunnable_engine_falls_back_to_software() {
        let selector = EncoderSelector::new("/nonexistent/ffmpeg", true);
        assert_eq!(selector.probe_host(), EncoderDescriptor::software());
    }

    #[test]
    fn test_video_args_shape() {
        let args = EncoderDescriptor::software().video_args();
        assert_eq!(&args[..2], &["-c:v".to_string(), "libx264".to_string()]);
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "20"));
    }

    // Any listing and any verification outcome yields a descriptor: detection never fails.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_selection_never_fails(
            listed in proptest::collection::vec(0usize..5, 0..5),
            accept_mask in any::<u8>(),
            os_idx in 0usize..3,
        ) {
            let pool = ["h264_nvenc", "h264_qsv", "h264_videotoolbox", "h264_amf", "libx264"];
            let available: HashSet<String> = listed.iter().map(|&i| pool[i].to_string()).collect();
            let os = ["linux", "macos", "windows"][os_idx];

            let selected = select_encoder(&available, os, |c| {
                let idx = pool.iter().position(|n| *n == c.name).unwrap_or(0);
                accept_mask & (1 << idx) != 0
            });

            let is_known = HARDWARE_CANDIDATES.iter().any(|c| c.name == selected.name)
                || selected.name == SOFTWARE_FALLBACK.name;
            prop_assert!(is_known);
            if selected.kind == EncoderKind::Hardware {
                prop_assert!(available.contains(&selected.name));
            }
        }
    }
}

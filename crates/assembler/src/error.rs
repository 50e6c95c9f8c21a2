//! Run-level failure taxonomy

use crate::engine::EngineError;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Trim,
    Concatenate,
    Mix,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "normalize",
            Stage::Trim => "trim",
            Stage::Concatenate => "concatenate",
            Stage::Mix => "mix",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an assembly run stopped
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// A source clip cannot be read as video
    #[error("cannot decode {}: {reason}", .path.display())]
    DecodeFailure { path: PathBuf, reason: String },

    /// The engine rejected an invocation; the source error keeps its stderr
    #[error("{stage} failed for {}: {source}", .input.display())]
    EncodeFailure {
        stage: Stage,
        input: PathBuf,
        #[source]
        source: EngineError,
    },

    /// Concatenation inputs do not share a stream layout
    #[error("clip {index} ({}) is incompatible with the sequence: {reason}", .input.display())]
    IncompatibleSequence {
        index: usize,
        input: PathBuf,
        reason: String,
    },

    #[error("timeline is empty")]
    EmptyTimeline,

    #[error("run cancelled before {before}")]
    Cancelled { before: Stage },

    #[error("I/O error during {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
}

impl AssemblyError {
    pub(crate) fn encode(stage: Stage, input: &Path, source: EngineError) -> Self {
        AssemblyError::EncodeFailure {
            stage,
            input: input.to_path_buf(),
            source,
        }
    }

    pub(crate) fn io(stage: Stage) -> impl FnOnce(std::io::Error) -> Self {
        move |source| AssemblyError::Io { stage, source }
    }

    /// Stage the failure is attributed to, when there is one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AssemblyError::DecodeFailure { .. } => Some(Stage::Normalize),
            AssemblyError::EncodeFailure { stage, .. } => Some(*stage),
            AssemblyError::IncompatibleSequence { .. } => Some(Stage::Concatenate),
            AssemblyError::EmptyTimeline => None,
            AssemblyError::Cancelled { before } => Some(*before),
            AssemblyError::Io { stage, .. } => Some(*stage),
        }
    }

    /// Offending input file, when the failure names one
    pub fn input(&self) -> Option<&Path> {
        match self {
            AssemblyError::DecodeFailure { path, .. } => Some(path),
            AssemblyError::EncodeFailure { input, .. } => Some(input),
            AssemblyError::IncompatibleSequence { input, .. } => Some(input),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AssemblyError::Cancelled { .. })
    }
}

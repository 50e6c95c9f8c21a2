//! Reel Assembler
//!
//! Turns an ordered list of source clips, each with a target duration, and an
//! optional voice track into one vertical-video file. Clips are normalized to a
//! shared canvas and encoding profile, cut to length, joined and mixed with the
//! voice track. Normalized clips are cached on disk across runs.

pub mod cache;
pub mod clip;
pub mod concat;
pub mod concurrency;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod metrics_server;
pub mod mix;
pub mod normalize;
pub mod pipeline;
pub mod probe;
pub mod startup;
pub mod trim;

pub use reel_assembler_config as config;
pub use reel_assembler_config::Config;
pub use cache::{CacheError, CacheStats, ClipCache};
pub use clip::{AssemblyResult, CacheKey, NormalizationSpec, OutputProfile, SourceClip};
pub use concat::Concatenator;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encoder::{EncoderDescriptor, EncoderKind, EncoderSelector};
pub use engine::{EngineCommand, EngineError, FfmpegEngine, MediaEngine};
pub use error::{AssemblyError, Stage};
pub use executor::{RunExecutor, RunReport};
pub use logging::init_logging;
pub use manifest::{load_request, ManifestError, RunManifest};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, MetricsSnapshot, RunMetrics, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use mix::AudioMixer;
pub use normalize::ClipNormalizer;
pub use pipeline::{
    Assembler, AssemblyRequest, AssemblySettings, CancelFlag, ClipRequest, Progress,
};
pub use probe::{MediaInfo, ProbeError};
pub use startup::{run_startup_checks, StartupError};
pub use trim::{DurationTrimmer, TrimMode};

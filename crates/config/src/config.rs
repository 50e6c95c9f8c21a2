//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its allowed range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// How the source frame is cropped onto the target canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    #[default]
    Center,
    Top,
    Bottom,
    /// Picks the crop window from the probed source geometry
    Smart,
}

impl CropMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CropMode::Center => "center",
            CropMode::Top => "top",
            CropMode::Bottom => "bottom",
            CropMode::Smart => "smart",
        }
    }
}

impl std::str::FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "center" => Ok(CropMode::Center),
            "top" => Ok(CropMode::Top),
            "bottom" => Ok(CropMode::Bottom),
            "smart" => Ok(CropMode::Smart),
            other => Err(format!("unknown crop mode '{}'", other)),
        }
    }
}

/// What happens to a clip's audio during normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// Remove all audio
    Strip,
    /// Carry source audio through; behaves like `AddSilent` when the source has none
    #[default]
    Keep,
    /// Synthesize a silent track matched to the clip
    AddSilent,
}

impl AudioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioMode::Strip => "strip",
            AudioMode::Keep => "keep",
            AudioMode::AddSilent => "add_silent",
        }
    }
}

impl std::str::FromStr for AudioMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strip" => Ok(AudioMode::Strip),
            "keep" => Ok(AudioMode::Keep),
            "add_silent" | "add-silent" => Ok(AudioMode::AddSilent),
            other => Err(format!("unknown audio mode '{}'", other)),
        }
    }
}

/// Override for how clips are cut to their requested duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Re-encode whenever downstream sync matters (always, for assembled timelines)
    #[default]
    Auto,
    /// Always re-encode
    Reencode,
    /// Always byte-copy; accepts keyframe-granular drift
    Copy,
}

impl std::str::FromStr for TrimPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TrimPolicy::Auto),
            "reencode" | "re-encode" => Ok(TrimPolicy::Reencode),
            "copy" => Ok(TrimPolicy::Copy),
            other => Err(format!("unknown trim policy '{}'", other)),
        }
    }
}

/// Target canvas configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanvasConfig {
    #[serde(default = "default_canvas_width")]
    pub width: u32,
    #[serde(default = "default_canvas_height")]
    pub height: u32,
    #[serde(default)]
    pub crop_mode: CropMode,
    /// Output frame rate shared by every normalized clip
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_canvas_width() -> u32 {
    1080
}

fn default_canvas_height() -> u32 {
    1920
}

fn default_fps() -> u32 {
    30
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_canvas_width(),
            height: default_canvas_height(),
            crop_mode: CropMode::default(),
            fps: default_fps(),
        }
    }
}

/// Canonical audio layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default)]
    pub mode: AudioMode,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u32,
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u32 {
    2
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::default(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

/// Voice/original audio gain levels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MixConfig {
    /// Gain applied to the clips' own audio (0 = discard it)
    #[serde(default)]
    pub original_volume: f32,
    /// Gain applied to the voice track
    #[serde(default = "default_voice_volume")]
    pub voice_volume: f32,
}

fn default_voice_volume() -> f32 {
    1.0
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            original_volume: 0.0,
            voice_volume: default_voice_volume(),
        }
    }
}

/// Duration trimming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrimConfig {
    #[serde(default)]
    pub policy: TrimPolicy,
    /// Accepted deviation between requested and realized clip length
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
}

fn default_tolerance_ms() -> u64 {
    50
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            policy: TrimPolicy::default(),
            tolerance_ms: default_tolerance_ms(),
        }
    }
}

/// Normalized-clip cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".reel-cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
        }
    }
}

/// Transcoding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Probe for hardware encoders before falling back to software
    #[serde(default = "default_true")]
    pub allow_hardware: bool,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            allow_hardware: true,
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkersConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Maximum concurrent assembly runs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_runs: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub mix: MixConfig,
    #[serde(default)]
    pub trim: TrimConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parse a boolean env value: "true"/"1"/"yes" and "false"/"0"/"no"
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Values that fail to parse are ignored and the file value is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Some(width) = env_parse::<u32>("REEL_CANVAS_WIDTH") {
            self.canvas.width = width;
        }
        if let Some(height) = env_parse::<u32>("REEL_CANVAS_HEIGHT") {
            self.canvas.height = height;
        }
        if let Some(mode) = env_parse::<CropMode>("REEL_CROP_MODE") {
            self.canvas.crop_mode = mode;
        }
        if let Some(mode) = env_parse::<AudioMode>("REEL_AUDIO_MODE") {
            self.audio.mode = mode;
        }
        if let Some(volume) = env_parse::<f32>("REEL_ORIGINAL_VOLUME") {
            self.mix.original_volume = volume;
        }
        if let Some(volume) = env_parse::<f32>("REEL_VOICE_VOLUME") {
            self.mix.voice_volume = volume;
        }
        if let Some(policy) = env_parse::<TrimPolicy>("REEL_TRIM_POLICY") {
            self.trim.policy = policy;
        }
        if let Some(ms) = env_parse::<u64>("REEL_TRIM_TOLERANCE_MS") {
            self.trim.tolerance_ms = ms;
        }
        if let Ok(dir) = env::var("REEL_CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.dir = PathBuf::from(dir);
            }
        }
        if let Some(enabled) = env::var("REEL_CACHE_ENABLED").ok().and_then(|v| parse_bool(&v)) {
            self.cache.enabled = enabled;
        }
        if let Some(allow) = env::var("REEL_ALLOW_HARDWARE").ok().and_then(|v| parse_bool(&v)) {
            self.encoder.allow_hardware = allow;
        }
        if let Some(runs) = env_parse::<u32>("REEL_MAX_CONCURRENT_RUNS") {
            self.workers.max_concurrent_runs = runs;
        }
        if let Ok(level) = env::var("REEL_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let canvas = &self.canvas;
        if canvas.width == 0 || canvas.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "canvas must be non-empty, got {}x{}",
                canvas.width, canvas.height
            )));
        }
        // yuv420p needs even dimensions
        if canvas.width % 2 != 0 || canvas.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "canvas dimensions must be even, got {}x{}",
                canvas.width, canvas.height
            )));
        }
        if canvas.fps == 0 {
            return Err(ConfigError::Invalid("canvas.fps must be > 0".to_string()));
        }
        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("audio.sample_rate must be > 0".to_string()));
        }
        if !(1..=2).contains(&self.audio.channels) {
            return Err(ConfigError::Invalid(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        for (name, volume) in [
            ("mix.original_volume", self.mix.original_volume),
            ("mix.voice_volume", self.mix.voice_volume),
        ] {
            if !volume.is_finite() || volume < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, volume
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides, and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "REEL_CANVAS_WIDTH",
            "REEL_CANVAS_HEIGHT",
            "REEL_CROP_MODE",
            "REEL_AUDIO_MODE",
            "REEL_ORIGINAL_VOLUME",
            "REEL_VOICE_VOLUME",
            "REEL_TRIM_POLICY",
            "REEL_TRIM_TOLERANCE_MS",
            "REEL_CACHE_DIR",
            "REEL_CACHE_ENABLED",
            "REEL_ALLOW_HARDWARE",
            "REEL_MAX_CONCURRENT_RUNS",
            "REEL_LOG_LEVEL",
        ] {
            env::remove_var(key);
        }
    }

    fn crop_mode_strategy() -> impl Strategy<Value = CropMode> {
        prop_oneof![
            Just(CropMode::Center),
            Just(CropMode::Top),
            Just(CropMode::Bottom),
            Just(CropMode::Smart),
        ]
    }

    fn audio_mode_strategy() -> impl Strategy<Value = AudioMode> {
        prop_oneof![
            Just(AudioMode::Strip),
            Just(AudioMode::Keep),
            Just(AudioMode::AddSilent),
        ]
    }

    // Every section written to TOML comes back with the same values.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            half_width in 1u32..2048,
            half_height in 1u32..2048,
            crop in crop_mode_strategy(),
            audio in audio_mode_strategy(),
            original_volume in 0.0f32..2.0,
            voice_volume in 0.0f32..2.0,
            tolerance_ms in 1u64..500,
            max_runs in 0u32..16,
            allow_hw in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[canvas]
width = {}
height = {}
crop_mode = "{}"

[audio]
mode = "{}"

[mix]
original_volume = {}
voice_volume = {}

[trim]
policy = "reencode"
tolerance_ms = {}

[workers]
max_concurrent_runs = {}

[encoder]
allow_hardware = {}
"#,
                half_width * 2,
                half_height * 2,
                crop.as_str(),
                audio.as_str(),
                original_volume,
                voice_volume,
                tolerance_ms,
                max_runs,
                allow_hw,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.canvas.width, half_width * 2);
            prop_assert_eq!(config.canvas.height, half_height * 2);
            prop_assert_eq!(config.canvas.crop_mode, crop);
            prop_assert_eq!(config.audio.mode, audio);
            prop_assert!((config.mix.original_volume - original_volume).abs() < 0.0001);
            prop_assert!((config.mix.voice_volume - voice_volume).abs() < 0.0001);
            prop_assert_eq!(config.trim.policy, TrimPolicy::Reencode);
            prop_assert_eq!(config.trim.tolerance_ms, tolerance_ms);
            prop_assert_eq!(config.workers.max_concurrent_runs, max_runs);
            prop_assert_eq!(config.encoder.allow_hardware, allow_hw);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_canvas(
            initial_width in 1u32..1000,
            override_width in 1u32..4000,
            override_height in 1u32..4000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[canvas]\nwidth = {}\n", initial_width * 2);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REEL_CANVAS_WIDTH", override_width.to_string());
            env::set_var("REEL_CANVAS_HEIGHT", override_height.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.canvas.width, override_width);
            prop_assert_eq!(config.canvas.height, override_height);
        }

        #[test]
        fn prop_env_overrides_volumes(
            original in 0.0f32..2.0,
            voice in 0.0f32..2.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("REEL_ORIGINAL_VOLUME", original.to_string());
            env::set_var("REEL_VOICE_VOLUME", voice.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.mix.original_volume - original).abs() < 0.0001);
            prop_assert!((config.mix.voice_volume - voice).abs() < 0.0001);
        }

        #[test]
        fn prop_env_overrides_modes(
            crop in crop_mode_strategy(),
            audio in audio_mode_strategy(),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("REEL_CROP_MODE", crop.as_str());
            env::set_var("REEL_AUDIO_MODE", audio.as_str().to_uppercase());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.canvas.crop_mode, crop);
            prop_assert_eq!(config.audio.mode, audio);
        }

        #[test]
        fn prop_odd_canvas_rejected(
            half in 1u32..1000,
        ) {
            let mut config = Config::default();
            config.canvas.width = half * 2 + 1;
            prop_assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.canvas.width, 1080);
        assert_eq!(config.canvas.height, 1920);
        assert_eq!(config.canvas.crop_mode, CropMode::Center);
        assert_eq!(config.canvas.fps, 30);
        assert_eq!(config.audio.mode, AudioMode::Keep);
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.mix.original_volume, 0.0);
        assert_eq!(config.mix.voice_volume, 1.0);
        assert_eq!(config.trim.policy, TrimPolicy::Auto);
        assert_eq!(config.trim.tolerance_ms, 50);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.dir, PathBuf::from(".reel-cache"));
        assert!(config.encoder.allow_hardware);
        assert_eq!(config.workers.max_concurrent_runs, 0);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[canvas]
width = 720
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.canvas.width, 720);
        assert_eq!(config.canvas.height, 1920);
        assert_eq!(config.trim.tolerance_ms, 50);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_unknown_crop_mode_is_parse_error() {
        let result = Config::parse_toml("[canvas]\ncrop_mode = \"diagonal\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut config = Config::default();
        config.mix.voice_volume = -0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_bool_env_keeps_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REEL_CACHE_ENABLED", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.cache.enabled);
    }
}

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
    /// A required value is absent
    Missing(&'static str),
    /// A value is present but unusable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Missing(field) => write!(f, "Missing required setting: {}", field),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
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

/// CPU-related configuration, used to size the transcoder thread pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// On-disk locations used by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Where retrieved source media is written
    pub download_dir: PathBuf,
    /// Where normalized output is written
    pub output_dir: PathBuf,
    /// JSON file holding the persisted seen/blacklist state
    pub state_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("work/downloads"),
            output_dir: PathBuf::from("work/output"),
            state_file: PathBuf::from("state/seen.json"),
        }
    }
}

/// Candidate discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Subreddits to pull listings from
    pub subreddits: Vec<String>,
    /// Listing kind: hot, top, new or rising
    pub listing: String,
    /// Time window for the `top` listing (hour, day, week, ...)
    pub time_filter: String,
    /// Items requested per source per round
    pub page_limit: u32,
    /// Minimum engagement score
    pub min_score: i64,
    /// Minimum comment count
    pub min_comments: i64,
    /// Lower bound on server-reported duration (advisory)
    pub min_declared_duration: f64,
    /// Upper bound on server-reported duration (advisory)
    pub max_declared_duration: f64,
    /// User-Agent sent to the content platform
    pub user_agent: String,
    /// Per-request timeout for listing calls
    pub request_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subreddits: Vec::new(),
            listing: "hot".to_string(),
            time_filter: "day".to_string(),
            page_limit: 50,
            min_score: 5000,
            min_comments: 100,
            min_declared_duration: 15.0,
            max_declared_duration: 180.0,
            user_agent: "reelrelay/0.1".to_string(),
            request_timeout_secs: 20,
        }
    }
}

/// Download retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Attempts before the url is recorded as failed
    pub max_attempts: u32,
    /// Base backoff in milliseconds: delay = base * 2^attempt + uniform(0, base)
    pub backoff_base_ms: u64,
    /// Timeout for establishing the request and receiving headers
    pub request_timeout_secs: u64,
    /// Wall-clock limit for a whole attempt including the body stream
    pub attempt_timeout_secs: u64,
    /// Downloads larger than this are aborted
    pub max_bytes: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2000,
            request_timeout_secs: 30,
            attempt_timeout_secs: 180,
            max_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Accepted frame orientation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Any,
    Portrait,
    Landscape,
    Square,
}

/// Suitability thresholds applied to probed media
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub min_duration: f64,
    pub max_duration: f64,
    /// Reject files without an audio stream
    pub require_audio: bool,
    pub min_width: u32,
    pub min_height: u32,
    /// Long-side limit
    pub max_width: u32,
    /// Short-side limit
    pub max_height: u32,
    pub orientation: Orientation,
    /// Empty means any codec
    pub allowed_codecs: Vec<String>,
    /// 0 disables the check
    pub min_bitrate_kbps: u32,
    /// 0 disables the check
    pub min_fps: f64,
    /// Run the decode-only integrity pass
    pub check_corruption: bool,
    /// Wall-clock limit for each prober invocation
    pub probe_timeout_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_duration: 15.0,
            max_duration: 90.0,
            require_audio: false,
            min_width: 240,
            min_height: 240,
            max_width: 3840,
            max_height: 2160,
            orientation: Orientation::Any,
            allowed_codecs: Vec::new(),
            min_bitrate_kbps: 0,
            min_fps: 0.0,
            check_corruption: true,
            probe_timeout_secs: 120,
        }
    }
}

/// How the start offset is picked when the source is longer than the target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetStrategy {
    /// Window centered on the source midpoint
    #[default]
    Center,
    /// Window covering the most scene cuts
    Scene,
}

/// Target format and transcoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizeConfig {
    pub target_width: u32,
    pub target_height: u32,
    /// Maximum output length in seconds
    pub target_duration: f64,
    /// Sources shorter than this are looped up to it
    pub min_output_duration: f64,
    pub target_fps: u32,
    /// Wall-clock limit for one transcode
    pub timeout_secs: u64,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate: String,
    /// Integrated loudness target in LUFS
    pub loudness_target: f64,
    pub offset_strategy: OffsetStrategy,
    pub contrast: f64,
    pub brightness: f64,
    pub fade_secs: f64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            target_width: 1080,
            target_height: 1920,
            target_duration: 60.0,
            min_output_duration: 15.0,
            target_fps: 30,
            timeout_secs: 150,
            video_codec: "libx264".to_string(),
            preset: "fast".to_string(),
            crf: 23,
            audio_bitrate: "128k".to_string(),
            loudness_target: -16.0,
            offset_strategy: OffsetStrategy::Center,
            contrast: 1.1,
            brightness: 0.05,
            fade_secs: 1.0,
        }
    }
}

/// Messaging channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// Operator chat for alerts; falls back to `chat_id`
    pub alert_chat_id: Option<String>,
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub hashtags: Vec<String>,
    pub caption_max_chars: usize,
}

impl DeliveryConfig {
    /// Chat that receives operator alerts
    pub fn alert_chat(&self) -> Option<&str> {
        let non_empty: for<'a> fn(&'a Option<String>) -> Option<&'a str> = |c| c.as_deref().filter(|c| !c.is_empty());
        non_empty(&self.alert_chat_id).or(non_empty(&self.chat_id))
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            alert_chat_id: None,
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_secs: 120,
            hashtags: vec![
                "#Shorts".to_string(),
                "#Viral".to_string(),
                "#Trending".to_string(),
            ],
            caption_max_chars: 1024,
        }
    }
}

/// Control-loop pacing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pause after a successful delivery
    pub cooldown_secs: u64,
    /// Pause when discovery returns nothing
    pub empty_cooldown_secs: u64,
    /// Upper bound of the uniform jitter added to every pause
    pub cooldown_jitter_secs: u64,
    /// Ceiling for the escalating failure backoff
    pub max_backoff_secs: u64,
    /// Candidates attempted per round
    pub batch_limit: usize,
    /// Consecutive failed rounds before an operator alert
    pub alert_after_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            empty_cooldown_secs: 60,
            cooldown_jitter_secs: 30,
            max_backoff_secs: 3600,
            batch_limit: 10,
            alert_after_failures: 3,
        }
    }
}

/// Status endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7879".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub status: StatusConfig,
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
    /// Overrides the following values if environment variables are set:
    /// - TELEGRAM_BOT_TOKEN -> delivery.bot_token
    /// - TELEGRAM_CHAT_ID -> delivery.chat_id
    /// - TELEGRAM_ALERT_CHAT_ID -> delivery.alert_chat_id
    /// - REDDIT_USER_AGENT -> discovery.user_agent
    /// - REELRELAY_SUBREDDITS -> discovery.subreddits (comma separated)
    /// - REELRELAY_STATE_FILE -> paths.state_file
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = non_empty_var("TELEGRAM_BOT_TOKEN") {
            self.delivery.bot_token = Some(token);
        }

        if let Some(chat) = non_empty_var("TELEGRAM_CHAT_ID") {
            self.delivery.chat_id = Some(chat);
        }

        if let Some(chat) = non_empty_var("TELEGRAM_ALERT_CHAT_ID") {
            self.delivery.alert_chat_id = Some(chat);
        }

        if let Some(agent) = non_empty_var("REDDIT_USER_AGENT") {
            self.discovery.user_agent = agent;
        }

        if let Some(list) = non_empty_var("REELRELAY_SUBREDDITS") {
            let subs: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !subs.is_empty() {
                self.discovery.subreddits = subs;
            }
        }

        if let Some(path) = non_empty_var("REELRELAY_STATE_FILE") {
            self.paths.state_file = PathBuf::from(path);
        }

        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("CPU_TARGET_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }
    }

    /// Check that the configuration can drive the pipeline.
    ///
    /// Everything reported here is fatal at startup; none of it is re-checked
    /// once the loop is running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.bot_token.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("delivery.bot_token"));
        }
        if self.delivery.chat_id.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("delivery.chat_id"));
        }
        if self.discovery.subreddits.is_empty() {
            return Err(ConfigError::Missing("discovery.subreddits"));
        }
        if self.discovery.min_declared_duration > self.discovery.max_declared_duration {
            return Err(ConfigError::Invalid(format!(
                "discovery.min_declared_duration ({}) exceeds max_declared_duration ({})",
                self.discovery.min_declared_duration, self.discovery.max_declared_duration
            )));
        }
        if self.gate.min_duration > self.gate.max_duration {
            return Err(ConfigError::Invalid(format!(
                "gate.min_duration ({}) exceeds gate.max_duration ({})",
                self.gate.min_duration, self.gate.max_duration
            )));
        }
        if self.gate.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gate.probe_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.retrieval.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.normalize.target_width == 0 || self.normalize.target_height == 0 {
            return Err(ConfigError::Invalid(
                "normalize target dimensions must be non-zero".to_string(),
            ));
        }
        if self.normalize.target_duration <= 2.0 * self.normalize.fade_secs {
            return Err(ConfigError::Invalid(format!(
                "normalize.target_duration ({}) must exceed both fades ({}s each)",
                self.normalize.target_duration, self.normalize.fade_secs
            )));
        }
        if self.normalize.min_output_duration > self.normalize.target_duration {
            return Err(ConfigError::Invalid(format!(
                "normalize.min_output_duration ({}) exceeds target_duration ({})",
                self.normalize.min_output_duration, self.normalize.target_duration
            )));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
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
        env::remove_var("TELEGRAM_BOT_TOKEN");
        env::remove_var("TELEGRAM_CHAT_ID");
        env::remove_var("TELEGRAM_ALERT_CHAT_ID");
        env::remove_var("REDDIT_USER_AGENT");
        env::remove_var("REELRELAY_SUBREDDITS");
        env::remove_var("REELRELAY_STATE_FILE");
        env::remove_var("CPU_LOGICAL_CORES");
        env::remove_var("CPU_TARGET_UTILIZATION");
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.delivery.bot_token = Some("123:abc".to_string());
        config.delivery.chat_id = Some("-100200300".to_string());
        config.discovery.subreddits = vec!["nextfuckinglevel".to_string()];
        config
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_threshold_sections(
            min_score in 0i64..100_000,
            min_comments in 0i64..50_000,
            gate_min in 1.0f64..30.0,
            gate_span in 1.0f64..120.0,
            attempts in 1u32..10,
            require_audio in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[discovery]
subreddits = ["a", "b"]
min_score = {}
min_comments = {}

[retrieval]
max_attempts = {}

[gate]
min_duration = {}
max_duration = {}
require_audio = {}
"#,
                min_score,
                min_comments,
                attempts,
                gate_min,
                gate_min + gate_span,
                require_audio
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.discovery.subreddits.len(), 2);
            prop_assert_eq!(config.discovery.min_score, min_score);
            prop_assert_eq!(config.discovery.min_comments, min_comments);
            prop_assert_eq!(config.retrieval.max_attempts, attempts);
            prop_assert!((config.gate.min_duration - gate_min).abs() < 1e-9);
            prop_assert!((config.gate.max_duration - (gate_min + gate_span)).abs() < 1e-9);
            prop_assert_eq!(config.gate.require_audio, require_audio);
        }

        #[test]
        fn prop_env_overrides_cpu_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[cpu]
{}
"#,
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CPU_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cpu.logical_cores, Some(override_cores));
        }

        #[test]
        fn prop_min_above_max_duration_is_rejected(
            max in 1.0f64..100.0,
            excess in 0.1f64..50.0,
        ) {
            let mut config = valid_config();
            config.gate.min_duration = max + excess;
            config.gate.max_duration = max;

            let result = config.validate();
            prop_assert!(matches!(result, Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.cpu.logical_cores, None);
        assert_eq!(config.discovery.listing, "hot");
        assert_eq!(config.retrieval.max_attempts, 3);
        assert!((config.gate.min_duration - 15.0).abs() < 1e-9);
        assert!((config.gate.max_duration - 90.0).abs() < 1e-9);
        assert!(!config.gate.require_audio);
        assert_eq!(config.normalize.target_width, 1080);
        assert_eq!(config.normalize.target_height, 1920);
        assert_eq!(config.normalize.offset_strategy, OffsetStrategy::Center);
        assert_eq!(config.gate.orientation, Orientation::Any);
        assert!(config.status.enabled);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[normalize]
target_duration = 45.0
offset_strategy = "scene"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert!((config.normalize.target_duration - 45.0).abs() < 1e-9);
        assert_eq!(config.normalize.offset_strategy, OffsetStrategy::Scene);
        assert_eq!(config.normalize.crf, 23);
        assert_eq!(config.normalize.timeout_secs, 150);
    }

    #[test]
    fn test_validate_requires_credentials() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.delivery.bot_token = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("delivery.bot_token"))
        ));

        let mut config = valid_config();
        config.delivery.chat_id = Some(String::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("delivery.chat_id"))
        ));

        let mut config = valid_config();
        config.discovery.subreddits.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("discovery.subreddits"))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = valid_config();
        config.retrieval.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides_credentials_and_subreddits() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TELEGRAM_BOT_TOKEN", "999:xyz");
        env::set_var("TELEGRAM_CHAT_ID", "42");
        env::set_var("REELRELAY_SUBREDDITS", "Unexpected, , instant_regret");
        env::set_var("REELRELAY_STATE_FILE", "/var/lib/reelrelay/seen.json");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.delivery.bot_token.as_deref(), Some("999:xyz"));
        assert_eq!(config.delivery.chat_id.as_deref(), Some("42"));
        assert_eq!(
            config.discovery.subreddits,
            vec!["Unexpected".to_string(), "instant_regret".to_string()]
        );
        assert_eq!(
            config.paths.state_file,
            PathBuf::from("/var/lib/reelrelay/seen.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_alert_chat_falls_back_to_delivery_chat() {
        let mut config = valid_config();
        assert_eq!(config.delivery.alert_chat(), Some("-100200300"));

        config.delivery.alert_chat_id = Some(String::new());
        assert_eq!(config.delivery.alert_chat(), Some("-100200300"));

        config.delivery.alert_chat_id = Some("7".to_string());
        assert_eq!(config.delivery.alert_chat(), Some("7"));
    }

    #[test]
    fn test_validate_rejects_zero_probe_timeout() {
        let mut config = valid_config();
        config.gate.probe_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

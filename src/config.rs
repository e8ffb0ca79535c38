use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: PathBuf,
    pub data_dir: PathBuf,

    // Dispatcher
    pub poll_interval: Duration,
    pub stale_job_after: Duration,
    pub heartbeat_interval: Duration,
    pub cafe_refresh_interval: Option<Duration>,
    pub worker_mode: WorkerMode,
    pub worker_binary_path: PathBuf,

    // Session
    pub session_state_path: Option<PathBuf>,
    pub session_encryption_key: Option<String>,

    // Target site
    pub cafe_base_url: String,
    pub mobile_cafe_base_url: String,
    pub api_base_url: String,
    pub search_page_size: usize,
    pub cafe_candidate_multiplier: usize,

    // Browser and pacing
    pub chrome_path: Option<String>,
    pub navigation_timeout: Duration,
    pub dom_timeout: Duration,
    pub http_timeout: Duration,
    pub request_delay_min: Duration,
    pub request_delay_max: Duration,

    // Extraction
    pub max_comments: usize,
    pub max_comment_expansions: usize,
    pub store_raw_html: bool,

    // Sinks
    pub sheet_webhook_url: Option<String>,
    pub sheet_batch_size: usize,
    pub sheet_cell_limit: usize,
    pub sink_timeout: Duration,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_base_url: String,
}

/// How the dispatcher runs a selected job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Run the job inside the dispatcher process.
    Inline,
    /// Spawn the `scrape-worker` binary and wait for it.
    Subprocess,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let refresh_secs = parse_env_u64("CAFE_REFRESH_INTERVAL_SECS", 3600)?;

        Ok(Self {
            // Storage
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/cafe-archiver.sqlite",
            )),
            data_dir: PathBuf::from(env_or_default("DATA_DIR", "./data")),

            // Dispatcher
            poll_interval: Duration::from_secs(parse_env_u64("POLL_INTERVAL_SECS", 5)?),
            stale_job_after: Duration::from_secs(parse_env_u64("STALE_JOB_SECS", 300)?),
            heartbeat_interval: Duration::from_secs(parse_env_u64("HEARTBEAT_INTERVAL_SECS", 15)?),
            cafe_refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            worker_mode: parse_worker_mode(&env_or_default("WORKER_MODE", "inline"))?,
            worker_binary_path: PathBuf::from(env_or_default("WORKER_BINARY_PATH", "scrape-worker")),

            // Session
            session_state_path: optional_env("SESSION_STATE_PATH").map(PathBuf::from),
            session_encryption_key: optional_env("SESSION_ENCRYPTION_KEY"),

            // Target site
            cafe_base_url: trim_url(env_or_default("CAFE_BASE_URL", "https://cafe.naver.com")),
            mobile_cafe_base_url: trim_url(env_or_default(
                "MOBILE_CAFE_BASE_URL",
                "https://m.cafe.naver.com",
            )),
            api_base_url: trim_url(env_or_default("API_BASE_URL", "https://apis.naver.com")),
            search_page_size: parse_env_usize("SEARCH_PAGE_SIZE", 50)?,
            cafe_candidate_multiplier: parse_env_usize("CAFE_CANDIDATE_MULTIPLIER", 3)?,

            // Browser and pacing
            chrome_path: optional_env("CHROME_PATH"),
            navigation_timeout: Duration::from_secs(parse_env_u64("NAVIGATION_TIMEOUT_SECS", 30)?),
            dom_timeout: Duration::from_secs(parse_env_u64("DOM_TIMEOUT_SECS", 10)?),
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 20)?),
            request_delay_min: Duration::from_millis(parse_env_u64("REQUEST_DELAY_MIN_MS", 700)?),
            request_delay_max: Duration::from_millis(parse_env_u64("REQUEST_DELAY_MAX_MS", 1800)?),

            // Extraction
            max_comments: parse_env_usize("MAX_COMMENTS", 250)?,
            max_comment_expansions: parse_env_usize("MAX_COMMENT_EXPANSIONS", 10)?,
            store_raw_html: parse_env_bool("STORE_RAW_HTML", false)?,

            // Sinks
            sheet_webhook_url: optional_env("SHEET_WEBHOOK_URL"),
            sheet_batch_size: parse_env_usize("SHEET_BATCH_SIZE", 1)?,
            sheet_cell_limit: parse_env_usize("SHEET_CELL_LIMIT", 45_000)?,
            sink_timeout: Duration::from_secs(parse_env_u64("SINK_TIMEOUT_SECS", 20)?),
            telegram_bot_token: optional_env("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: optional_env("TELEGRAM_CHAT_ID"),
            telegram_api_base_url: trim_url(env_or_default(
                "TELEGRAM_API_BASE_URL",
                "https://api.telegram.org",
            )),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search_page_size == 0 || self.search_page_size > 100 {
            return Err(ConfigError::InvalidValue {
                name: "SEARCH_PAGE_SIZE".to_string(),
                message: "must be between 1 and 100".to_string(),
            });
        }
        if self.cafe_candidate_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CAFE_CANDIDATE_MULTIPLIER".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.sheet_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "SHEET_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.request_delay_min > self.request_delay_max {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_DELAY_MIN_MS".to_string(),
                message: "cannot exceed REQUEST_DELAY_MAX_MS".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "POLL_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.telegram_bot_token.is_some() != self.telegram_chat_id.is_some() {
            return Err(ConfigError::InvalidValue {
                name: "TELEGRAM_CHAT_ID".to_string(),
                message: "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".to_string(),
            });
        }
        Ok(())
    }

    /// Baseline configuration for tests: no pacing, no sinks, no maintenance jobs.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from("./data/test.sqlite"),
            data_dir: PathBuf::from("./data/test"),
            poll_interval: Duration::from_secs(1),
            stale_job_after: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(15),
            cafe_refresh_interval: None,
            worker_mode: WorkerMode::Inline,
            worker_binary_path: PathBuf::from("scrape-worker"),
            session_state_path: None,
            session_encryption_key: None,
            cafe_base_url: "https://cafe.naver.com".to_string(),
            mobile_cafe_base_url: "https://m.cafe.naver.com".to_string(),
            api_base_url: "https://apis.naver.com".to_string(),
            search_page_size: 50,
            cafe_candidate_multiplier: 3,
            chrome_path: None,
            navigation_timeout: Duration::from_secs(5),
            dom_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(5),
            request_delay_min: Duration::ZERO,
            request_delay_max: Duration::ZERO,
            max_comments: 250,
            max_comment_expansions: 3,
            store_raw_html: false,
            sheet_webhook_url: None,
            sheet_batch_size: 1,
            sheet_cell_limit: 45_000,
            sink_timeout: Duration::from_secs(5),
            telegram_bot_token: None,
            telegram_chat_id: None,
            telegram_api_base_url: "https://api.telegram.org".to_string(),
        }
    }

    /// Directory holding per-job result documents.
    #[must_use]
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }
}

fn trim_url(value: String) -> String {
    value.trim_end_matches('/').to_string()
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_worker_mode(value: &str) -> Result<WorkerMode, ConfigError> {
    match value.to_lowercase().as_str() {
        "inline" => Ok(WorkerMode::Inline),
        "subprocess" => Ok(WorkerMode::Subprocess),
        _ => Err(ConfigError::InvalidValue {
            name: "WORKER_MODE".to_string(),
            message: format!("must be 'inline' or 'subprocess', got '{value}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_worker_mode() {
        assert_eq!(parse_worker_mode("inline").unwrap(), WorkerMode::Inline);
        assert_eq!(parse_worker_mode("SUBPROCESS").unwrap(), WorkerMode::Subprocess);
        assert!(parse_worker_mode("threads").is_err());
    }

    #[test]
    fn test_parse_bool_default() {
        assert!(parse_env_bool("CAFE_ARCHIVER_NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("CAFE_ARCHIVER_NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    #[serial]
    fn test_refresh_interval_zero_disables() {
        std::env::set_var("CAFE_REFRESH_INTERVAL_SECS", "0");
        let config = Config::from_env().unwrap();
        std::env::remove_var("CAFE_REFRESH_INTERVAL_SECS");
        assert!(config.cafe_refresh_interval.is_none());
    }

    #[test]
    #[serial]
    fn test_invalid_integer_is_reported() {
        std::env::set_var("STALE_JOB_SECS", "five minutes");
        let result = Config::from_env();
        std::env::remove_var("STALE_JOB_SECS");
        assert!(matches!(result, Err(ConfigError::ParseInt { name, .. }) if name == "STALE_JOB_SECS"));
    }

    #[test]
    fn test_validate_rejects_oversized_page() {
        let config = Config {
            search_page_size: 500,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
        assert!(Config::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_telegram_pair() {
        let config = Config {
            telegram_bot_token: Some("token".to_string()),
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }
}

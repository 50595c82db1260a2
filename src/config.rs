//! Configuration types.
//!
//! Everything is read from environment-style key/value pairs. `from_env()` is
//! the production entry point; `from_lookup()` takes any key → value function
//! so tests can feed a plain map.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// What the ingestion side does with a task the queue refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Run the task through the processing pipeline synchronously, in-process.
    Direct,
    /// Drop the task with a warning.
    Skip,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "skip" => Ok(Self::Skip),
            other => Err(format!("expected 'direct' or 'skip', got '{other}'")),
        }
    }
}

/// Microsoft Graph mail source settings. Present only when a tenant or a
/// static bearer token is configured.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    /// OAuth2 authority used for the client-credentials flow.
    pub authority_url: String,
    /// `me`, or the user id / address of the mailbox to read.
    pub mailbox: String,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub bearer_token: Option<SecretString>,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Queue identity inside the store.
    pub queue_name: String,
    /// Enqueue is rejected once the queue holds this many tasks.
    pub max_queue_size: usize,
    /// Attachments larger than this (bytes) are dropped by the filter.
    pub max_attachment_size: u64,
    /// Extension allow-set, lowercase with leading dot. Empty means any.
    pub allowed_extensions: Vec<String>,
    /// Sender / domain allow-list for the source. Empty means everyone.
    pub source_membership: Vec<String>,
    /// Number of concurrently running workers.
    pub max_concurrent_workers: usize,
    /// Dequeue poll timeout; also the idle heartbeat cadence.
    pub worker_poll_interval: Duration,
    /// Deadline for a single pipeline attempt.
    pub processing_timeout: Duration,
    /// Retries after the first attempt.
    pub max_pipeline_retries: u32,
    /// Base for exponential backoff between attempts.
    pub retry_base_delay: Duration,
    /// Bound on one result-sink write.
    pub result_sink_timeout: Duration,
    /// Interval between source polls.
    pub source_poll_interval: Duration,
    /// A worker whose heartbeat is older than this is hard-restarted.
    pub heartbeat_timeout: Duration,
    /// Supervision loop interval.
    pub heartbeat_check_interval: Duration,
    /// Unplanned restarts allowed per worker slot (0 = unlimited).
    pub max_worker_restarts: u32,
    /// What to do with a task the queue refused.
    pub queue_fallback: FallbackPolicy,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Control API port (None disables the API).
    pub api_port: Option<u16>,
    /// Directory for the rolling log file, if any.
    pub log_dir: Option<PathBuf>,
    /// Mail source settings, if configured.
    pub graph: Option<GraphConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let processing_timeout = Duration::from_secs(300); // 5 minutes
        Self {
            queue_name: "email_attachments".to_string(),
            max_queue_size: 1000,
            max_attachment_size: 50 * 1024 * 1024, // 50MB
            allowed_extensions: vec![".pdf".into(), ".docx".into(), ".xlsx".into()],
            source_membership: Vec::new(),
            max_concurrent_workers: 2,
            worker_poll_interval: Duration::from_secs(5),
            processing_timeout,
            max_pipeline_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            result_sink_timeout: Duration::from_secs(30),
            source_poll_interval: Duration::from_secs(300),
            heartbeat_timeout: processing_timeout + Duration::from_secs(60),
            heartbeat_check_interval: Duration::from_secs(30),
            max_worker_restarts: 10,
            queue_fallback: FallbackPolicy::Direct,
            db_path: PathBuf::from("./data/attachment-intake.db"),
            api_port: Some(8080),
            log_dir: None,
            graph: None,
        }
    }
}

impl ServiceConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let processing_timeout = secs(&get, "PROCESSING_TIMEOUT", defaults.processing_timeout)?;
        let heartbeat_default = processing_timeout + Duration::from_secs(60);

        let api_port = match parse::<u16>(&get, "API_PORT")? {
            Some(0) => None,
            Some(port) => Some(port),
            None => defaults.api_port,
        };

        let config = Self {
            queue_name: get("QUEUE_NAME").unwrap_or(defaults.queue_name),
            max_queue_size: parse(&get, "MAX_QUEUE_SIZE")?.unwrap_or(defaults.max_queue_size),
            max_attachment_size: parse(&get, "MAX_ATTACHMENT_SIZE")?
                .unwrap_or(defaults.max_attachment_size),
            allowed_extensions: match lookup("FILE_TYPES") {
                Some(raw) => parse_extensions(&raw),
                None => defaults.allowed_extensions,
            },
            source_membership: get("SOURCE_MEMBERSHIP")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            max_concurrent_workers: parse(&get, "MAX_CONCURRENT_WORKERS")?
                .unwrap_or(defaults.max_concurrent_workers),
            worker_poll_interval: secs(&get, "WORKER_POLL_INTERVAL", defaults.worker_poll_interval)?,
            processing_timeout,
            max_pipeline_retries: parse(&get, "MAX_PIPELINE_RETRIES")?
                .unwrap_or(defaults.max_pipeline_retries),
            retry_base_delay: parse::<u64>(&get, "RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            result_sink_timeout: secs(&get, "RESULT_SINK_TIMEOUT", defaults.result_sink_timeout)?,
            source_poll_interval: secs(&get, "SOURCE_POLL_INTERVAL", defaults.source_poll_interval)?,
            heartbeat_timeout: secs(&get, "WORKER_HEARTBEAT_TIMEOUT", heartbeat_default)?,
            heartbeat_check_interval: secs(
                &get,
                "WORKER_CHECK_INTERVAL",
                defaults.heartbeat_check_interval,
            )?,
            max_worker_restarts: parse(&get, "MAX_WORKER_RESTARTS")?
                .unwrap_or(defaults.max_worker_restarts),
            queue_fallback: parse(&get, "QUEUE_FALLBACK")?.unwrap_or(defaults.queue_fallback),
            db_path: get("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            api_port,
            log_dir: get("LOG_DIR").map(PathBuf::from),
            graph: graph_from_lookup(&get),
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks. Called by `from_lookup`; call it yourself when
    /// building a config by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(invalid("MAX_CONCURRENT_WORKERS", "must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("MAX_QUEUE_SIZE", "must be at least 1"));
        }
        for (key, value) in [
            ("WORKER_POLL_INTERVAL", self.worker_poll_interval),
            ("PROCESSING_TIMEOUT", self.processing_timeout),
            ("RESULT_SINK_TIMEOUT", self.result_sink_timeout),
            ("SOURCE_POLL_INTERVAL", self.source_poll_interval),
            ("WORKER_HEARTBEAT_TIMEOUT", self.heartbeat_timeout),
            ("WORKER_CHECK_INTERVAL", self.heartbeat_check_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        // Workers heartbeat on every dequeue, attempt, backoff sleep and
        // recorded result. A silent stretch is at most one pipeline attempt
        // followed by its sink write, or one idle wait, or one backoff.
        if self.heartbeat_timeout <= self.max_silent_stretch() {
            return Err(invalid(
                "WORKER_HEARTBEAT_TIMEOUT",
                "must be longer than PROCESSING_TIMEOUT + RESULT_SINK_TIMEOUT, WORKER_POLL_INTERVAL and the longest retry backoff",
            ));
        }
        Ok(())
    }

    /// Longest time a healthy worker can go without a heartbeat.
    pub fn max_silent_stretch(&self) -> Duration {
        self.processing_timeout
            .saturating_add(self.result_sink_timeout)
            .max(self.worker_poll_interval)
            .max(self.max_backoff())
    }

    /// Longest backoff sleep the retry loop can take.
    pub fn max_backoff(&self) -> Duration {
        backoff_delay(self.retry_base_delay, self.max_pipeline_retries.saturating_sub(1))
    }
}

/// `base * 2^attempt`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    match 2u32.checked_pow(attempt) {
        Some(factor) => base.checked_mul(factor).unwrap_or(Duration::MAX),
        None => Duration::MAX,
    }
}

fn graph_from_lookup(get: &impl Fn(&str) -> Option<String>) -> Option<GraphConfig> {
    let tenant_id = get("GRAPH_TENANT_ID");
    let bearer_token = get("SOURCE_BEARER_TOKEN").map(SecretString::from);
    if tenant_id.is_none() && bearer_token.is_none() {
        return None;
    }
    Some(GraphConfig {
        base_url: get("GRAPH_BASE_URL")
            .unwrap_or_else(|| "https://graph.microsoft.com/v1.0".to_string()),
        authority_url: get("GRAPH_AUTHORITY_URL")
            .unwrap_or_else(|| "https://login.microsoftonline.com".to_string()),
        mailbox: get("GRAPH_MAILBOX").unwrap_or_else(|| "me".to_string()),
        tenant_id,
        client_id: get("GRAPH_CLIENT_ID"),
        client_secret: get("GRAPH_CLIENT_SECRET").map(SecretString::from),
        bearer_token,
    })
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("'{raw}': {e}"))),
        None => Ok(None),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse::<u64>(get, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Normalise `pdf, .DOCX` into `[".pdf", ".docx"]`.
pub fn parse_extensions(raw: &str) -> Vec<String> {
    split_list(raw)
        .into_iter()
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.queue_name, "email_attachments");
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_attachment_size, 50 * 1024 * 1024);
        assert_eq!(config.max_pipeline_retries, 3);
        assert_eq!(config.queue_fallback, FallbackPolicy::Direct);
        assert_eq!(config.api_port, Some(8080));
        assert!(config.graph.is_none());
    }

    #[test]
    fn recognised_keys_override_defaults() {
        let config = from_pairs(&[
            ("QUEUE_NAME", "uploads"),
            ("MAX_QUEUE_SIZE", "2"),
            ("MAX_ATTACHMENT_SIZE", "1024"),
            ("MAX_CONCURRENT_WORKERS", "4"),
            ("WORKER_POLL_INTERVAL", "1"),
            ("PROCESSING_TIMEOUT", "10"),
            ("MAX_PIPELINE_RETRIES", "0"),
            ("SOURCE_POLL_INTERVAL", "30"),
            ("QUEUE_FALLBACK", "skip"),
            ("API_PORT", "0"),
        ])
        .unwrap();
        assert_eq!(config.queue_name, "uploads");
        assert_eq!(config.max_queue_size, 2);
        assert_eq!(config.max_attachment_size, 1024);
        assert_eq!(config.max_concurrent_workers, 4);
        assert_eq!(config.worker_poll_interval, Duration::from_secs(1));
        assert_eq!(config.processing_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(70));
        assert_eq!(config.max_pipeline_retries, 0);
        assert_eq!(config.source_poll_interval, Duration::from_secs(30));
        assert_eq!(config.queue_fallback, FallbackPolicy::Skip);
        assert_eq!(config.api_port, None);
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = from_pairs(&[("MAX_QUEUE_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_QUEUE_SIZE"));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(from_pairs(&[("MAX_CONCURRENT_WORKERS", "0")]).is_err());
    }

    #[test]
    fn heartbeat_must_outlast_processing_timeout() {
        let err = from_pairs(&[("PROCESSING_TIMEOUT", "60"), ("WORKER_HEARTBEAT_TIMEOUT", "30")])
            .unwrap_err();
        assert!(err.to_string().contains("WORKER_HEARTBEAT_TIMEOUT"));
    }

    #[test]
    fn heartbeat_must_cover_attempt_plus_sink_write() {
        // Longer than each bound alone, shorter than an attempt and its write.
        let config = ServiceConfig {
            worker_poll_interval: Duration::from_millis(100),
            processing_timeout: Duration::from_millis(200),
            result_sink_timeout: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(250),
            retry_base_delay: Duration::from_millis(1),
            ..ServiceConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RESULT_SINK_TIMEOUT"));

        let config = ServiceConfig {
            heartbeat_timeout: Duration::from_millis(301),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_types_normalised() {
        assert_eq!(parse_extensions("pdf, .DOCX ,,csv"), vec![".pdf", ".docx", ".csv"]);
        let config = from_pairs(&[("FILE_TYPES", "")]).unwrap();
        assert!(config.allowed_extensions.is_empty());
    }

    #[test]
    fn graph_enabled_by_token() {
        let config = from_pairs(&[("SOURCE_BEARER_TOKEN", "abc")]).unwrap();
        let graph = config.graph.unwrap();
        assert_eq!(graph.base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(graph.mailbox, "me");
        assert!(graph.bearer_token.is_some());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 64), Duration::MAX);
    }
}

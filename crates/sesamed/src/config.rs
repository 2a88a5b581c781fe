use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Agent configuration, loaded from `SESAME_*` environment variables.
///
/// The similarity threshold has no default: matching against an
/// unconfigured threshold is a configuration error, not a guess.
/// Malformed numeric values are likewise fatal rather than silently
/// replaced by defaults.
pub struct Config {
    /// Enrollment authority base URL.
    pub api_base_url: String,
    /// Identifier this device presents to the authority.
    pub device_id: String,
    /// Optional bearer token for the authority.
    pub token: Option<String>,
    /// V4L2 device path.
    pub camera_device: String,
    /// Extractor backend name (e.g. "facenet", "hashed").
    pub extractor: String,
    /// Path to the ONNX model file for the facenet backend.
    pub model_path: PathBuf,
    /// Embedding dimensionality for this deployment.
    pub embedding_dim: usize,
    /// Cosine similarity threshold for a positive match. Required.
    pub threshold: f32,
    /// GPIO chip device path.
    pub gpio_chip: String,
    /// Line offset driving the lock.
    pub lock_pin: u32,
    /// How long the lock is held unlocked per trigger.
    pub lock_pulse_ms: u64,
    /// Quiet period after relocking before the line is write-eligible again.
    pub relock_debounce_ms: u64,
    /// Line offset of the exit button.
    pub override_pin: u32,
    /// Debounce window for the exit button.
    pub override_debounce_ms: u64,
    pub override_pull_up: bool,
    pub override_active_low: bool,
    /// Seconds between successful sync cycles.
    pub sync_interval_secs: u64,
    /// Ceiling for the failure backoff.
    pub sync_backoff_max_secs: u64,
    /// Per-request timeout for authority calls.
    pub http_timeout_secs: u64,
    /// Persisted cache snapshot location.
    pub cache_path: PathBuf,
    /// Minimum seconds between face-match triggers.
    pub match_cooldown_secs: u64,
    /// Use a log-only lock line instead of real hardware.
    pub gpio_simulate: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key→value source; the indirection keeps tests off
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let threshold_raw =
            lookup("SESAME_THRESHOLD").ok_or(ConfigError::Missing("SESAME_THRESHOLD"))?;
        let threshold: f32 = threshold_raw.parse().map_err(|_| ConfigError::Invalid {
            key: "SESAME_THRESHOLD",
            value: threshold_raw.clone(),
        })?;

        Ok(Self {
            api_base_url: string_or(&lookup, "SESAME_API_BASE_URL", "http://127.0.0.1:8000"),
            device_id: string_or(&lookup, "SESAME_DEVICE_ID", "sesame-001"),
            token: lookup("SESAME_TOKEN"),
            camera_device: string_or(&lookup, "SESAME_CAMERA_DEVICE", "/dev/video0"),
            extractor: string_or(&lookup, "SESAME_EXTRACTOR", "facenet"),
            model_path: PathBuf::from(string_or(&lookup, "SESAME_MODEL_PATH", "facenet.onnx")),
            embedding_dim: parse_or(&lookup, "SESAME_EMBEDDING_DIM", 512)?,
            threshold,
            gpio_chip: string_or(&lookup, "SESAME_GPIO_CHIP", "/dev/gpiochip0"),
            lock_pin: parse_or(&lookup, "SESAME_LOCK_PIN", 17)?,
            lock_pulse_ms: parse_or(&lookup, "SESAME_LOCK_PULSE_MS", 800)?,
            relock_debounce_ms: parse_or(&lookup, "SESAME_RELOCK_DEBOUNCE_MS", 200)?,
            override_pin: parse_or(&lookup, "SESAME_OVERRIDE_PIN", 27)?,
            override_debounce_ms: parse_or(&lookup, "SESAME_OVERRIDE_DEBOUNCE_MS", 200)?,
            override_pull_up: flag_or(&lookup, "SESAME_OVERRIDE_PULL_UP", true),
            override_active_low: flag_or(&lookup, "SESAME_OVERRIDE_ACTIVE_LOW", true),
            sync_interval_secs: parse_or(&lookup, "SESAME_SYNC_INTERVAL_SECS", 300)?,
            sync_backoff_max_secs: parse_or(&lookup, "SESAME_SYNC_BACKOFF_MAX_SECS", 3600)?,
            http_timeout_secs: parse_or(&lookup, "SESAME_HTTP_TIMEOUT_SECS", 10)?,
            cache_path: PathBuf::from(string_or(
                &lookup,
                "SESAME_CACHE_PATH",
                "/var/lib/sesame/cache.json",
            )),
            match_cooldown_secs: parse_or(&lookup, "SESAME_MATCH_COOLDOWN_SECS", 5)?,
            gpio_simulate: flag_or(&lookup, "SESAME_GPIO_SIMULATE", false),
        })
    }
}

fn string_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn flag_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
        None => default,
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + '_ {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_threshold_is_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SESAME_THRESHOLD")));
    }

    #[test]
    fn test_unparsable_threshold_is_fatal() {
        let err =
            Config::from_lookup(lookup_from(&[("SESAME_THRESHOLD", "very high")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "SESAME_THRESHOLD",
                ..
            }
        ));
    }

    #[test]
    fn test_unparsable_optional_numeric_is_fatal() {
        // Defaults exist, but a present-and-garbage value must not be
        // silently replaced by one.
        let err = Config::from_lookup(lookup_from(&[
            ("SESAME_THRESHOLD", "0.6"),
            ("SESAME_LOCK_PULSE_MS", "eight hundred"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "SESAME_LOCK_PULSE_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup_from(&[("SESAME_THRESHOLD", "0.6")])).unwrap();
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.embedding_dim, 512);
        assert_eq!(config.lock_pulse_ms, 800);
        assert_eq!(config.sync_interval_secs, 300);
        assert_eq!(config.extractor, "facenet");
        assert_eq!(config.token, None);
        assert!(!config.gpio_simulate);
        assert!(config.override_pull_up);
    }

    #[test]
    fn test_overrides_win() {
        let config = Config::from_lookup(lookup_from(&[
            ("SESAME_THRESHOLD", "0.45"),
            ("SESAME_EMBEDDING_DIM", "128"),
            ("SESAME_EXTRACTOR", "hashed"),
            ("SESAME_GPIO_SIMULATE", "1"),
            ("SESAME_OVERRIDE_PULL_UP", "false"),
            ("SESAME_TOKEN", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.threshold, 0.45);
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.extractor, "hashed");
        assert!(config.gpio_simulate);
        assert!(!config.override_pull_up);
        assert_eq!(config.token.as_deref(), Some("secret"));
    }
}

use crate::models::Config;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Load configuration: defaults, then the TOML file (when present), then
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        }
        _ => Config::default(),
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("OCULINK_SERVER_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("OCULINK_SERVER_PORT")
        && let Ok(port) = port.parse()
    {
        config.server.port = port;
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis.url = (!url.is_empty()).then_some(url);
    }
    if let Ok(url) = std::env::var("OCR_SERVICE_URL") {
        config.ocr.base_url = url;
    }
    if let Ok(path) = std::env::var("OCULINK_SMBCLIENT_PATH") {
        config.smb.client_path = path;
    }
    if let Ok(minutes) = std::env::var("OCULINK_POLL_INTERVAL_MINUTES")
        && let Ok(minutes) = minutes.parse()
    {
        config.sync.poll_interval_minutes = minutes;
    }
    if let Ok(concurrency) = std::env::var("OCULINK_QUEUE_CONCURRENCY")
        && let Ok(concurrency) = concurrency.parse()
    {
        config.queue.concurrency = concurrency;
    }
    if let Ok(dir) = std::env::var("OCULINK_CACHE_DIR") {
        config.cache_dir = (!dir.is_empty()).then(|| dir.into());
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.sync.poll_interval_minutes == 0 {
        return Err(invalid("sync.poll_interval_minutes", "must be at least 1"));
    }
    if config.queue.concurrency == 0 {
        return Err(invalid("queue.concurrency", "must be at least 1"));
    }
    if config.smb.reconnect.max_attempts == 0 {
        return Err(invalid("smb.reconnect.max_attempts", "must be at least 1"));
    }
    if config.smb.reconnect.backoff_multiplier < 1.0 {
        return Err(invalid(
            "smb.reconnect.backoff_multiplier",
            "must be at least 1.0",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = load_config(None).unwrap();
        assert_eq!(config.server.port, 8087);
        assert_eq!(config.sync.poll_interval_minutes, 5);
        assert_eq!(config.queue.concurrency, 3);
        assert!(config.redis.url.is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile_dir();
        let path = dir.join("oculink.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9090

[redis]
url = "redis://cache:6379"

[sync]
poll_interval_minutes = 10
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.sync.poll_interval_minutes, 10);
        // Untouched sections keep defaults.
        assert_eq!(config.smb.client_path, "smbclient");
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn zero_intervals_rejected() {
        let dir = tempfile_dir();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[sync]\npoll_interval_minutes = 0\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Invalid { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "oculink-config-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}

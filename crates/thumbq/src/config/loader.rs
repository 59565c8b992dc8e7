use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Checks the schema cannot express, and re-checks bounds for configs built
/// in code.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::Validation { message });

    if config.version != "1.0" {
        return invalid(format!("Unsupported config version: {}", config.version));
    }
    if config.upload_directory.trim().is_empty() {
        return invalid("upload_directory must not be empty".to_string());
    }
    if config.worker_count == 0 {
        return invalid("worker_count must be at least 1".to_string());
    }
    if config.queue.max_attempts == 0 {
        return invalid("queue.max_attempts must be at least 1".to_string());
    }
    if config.queue.lease_timeout_secs == 0 || config.queue.poll_interval_ms == 0 {
        return invalid("queue timeouts must be non-zero".to_string());
    }
    if let crate::queue::BackoffPolicy::Exponential {
        delay_ms,
        max_delay_ms,
    } = config.queue.backoff
    {
        if max_delay_ms < delay_ms {
            return invalid(format!(
                "queue.backoff.max_delay_ms ({}) is below delay_ms ({})",
                max_delay_ms, delay_ms
            ));
        }
    }
    if config.thumbnail.width == 0 || config.thumbnail.height == 0 {
        return invalid("thumbnail dimensions must be non-zero".to_string());
    }
    if !(1..=100).contains(&config.thumbnail.quality) {
        return invalid(format!(
            "thumbnail.quality must be 1-100, got {}",
            config.thumbnail.quality
        ));
    }
    if config.events.capacity == 0 {
        return invalid("events.capacity must be at least 1".to_string());
    }
    if config.limits.max_file_bytes == 0 || config.limits.max_files == 0 {
        return invalid("limits must be non-zero".to_string());
    }

    Ok(())
}

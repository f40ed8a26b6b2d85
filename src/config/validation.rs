//! Configuration validation logic.

use crate::config::schema::ProxyCoreConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyCoreConfig for semantic correctness.
pub fn validate_config(config: &ProxyCoreConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.forwarder.activity_timeout_secs == 0 {
        errors.push(ValidationError(
            "forwarder.activity_timeout_secs must be > 0".to_string(),
        ));
    }
    if config.forwarder.upgrade_activity_timeout_secs == 0 {
        errors.push(ValidationError(
            "forwarder.upgrade_activity_timeout_secs must be > 0".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

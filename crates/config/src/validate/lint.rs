//! Configuration linting for best practices
//!
//! Checks configuration for settings that are valid but probably not what the
//! operator intended.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, DeploymentMode};

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    for record in &config.domains {
        // Registry matching is exact and case-sensitive; SNI names arrive lowercased
        if record.name.chars().any(|c| c.is_ascii_uppercase()) {
            result.add_warning(ValidationWarning::new(format!(
                "Domain '{}' contains uppercase letters and will never match a handshake",
                record.name
            )));
        }

        if record.name.starts_with("*.") {
            result.add_warning(ValidationWarning::new(format!(
                "Domain '{}' is a wildcard; only exact names are authorized",
                record.name
            )));
        }

        if record.name == config.admin.hostname {
            result.add_warning(ValidationWarning::new(format!(
                "Domain '{}' duplicates the admin hostname; admin.auto_tls governs it instead",
                record.name
            )));
        }
    }

    if config.domains.iter().all(|record| !record.managed_tls) && !config.admin.auto_tls {
        result.add_warning(ValidationWarning::new(
            "No hostname is eligible for automatic certificates".to_string(),
        ));
    }

    if config.mode == DeploymentMode::Development && !config.acme.staging {
        // The local test CA has a single directory; the flag is meaningless there
        result.add_warning(ValidationWarning::new(
            "Development mode always uses the local test CA directory".to_string(),
        ));
    }

    if config.listeners.http.port() != 80 && config.mode == DeploymentMode::Production {
        result.add_warning(ValidationWarning::new(format!(
            "HTTP listener on {} is not port 80; HTTP-01 challenges will fail unless traffic is forwarded",
            config.listeners.http
        )));
    }

    result
}

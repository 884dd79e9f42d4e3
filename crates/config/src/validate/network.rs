//! Backend reachability
//!
//! Validates that the plaintext backends TLS traffic is forwarded to are reachable.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Validate backend connectivity
pub async fn validate_backends(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let backends: [(&str, SocketAddr); 2] = [
        ("admin", config.admin.backend),
        ("public", config.listeners.backend),
    ];

    for (name, address) in backends {
        match timeout(Duration::from_secs(5), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Network,
                    format!("Backend '{}' at '{}' unreachable: {}", name, address, e),
                ));
            }
            Err(_) => {
                result.add_warning(ValidationWarning::new(format!(
                    "Backend '{}' at '{}' connection timeout (5s)",
                    name, address
                )));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_validate_backends_unreachable() {
        let mut config = Config::new("admin.example.com", "ops@example.com");
        config.admin.backend = "192.0.2.1:9999".parse().unwrap(); // TEST-NET-1 (unreachable)
        config.listeners.backend = "192.0.2.1:9998".parse().unwrap();

        let result = validate_backends(&config).await;

        // refused or timed out, depending on the network
        assert!(!result.errors.is_empty() || !result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_validate_backends_reachable() {
        let admin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = Config::new("admin.example.com", "ops@example.com");
        config.admin.backend = admin.local_addr().unwrap();
        config.listeners.backend = public.local_addr().unwrap();

        let result = validate_backends(&config).await;

        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }
}

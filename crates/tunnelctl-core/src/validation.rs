//! Input validation for tunnel definitions
//!
//! Everything here runs before any side effect of create/update.

use crate::error::SupervisorError;
use crate::model::{HealthCheckConfig, Service, Tunnel};

/// Maximum length of a DNS label
const MAX_LABEL_LEN: usize = 63;

/// Maximum length of a full hostname
const MAX_HOSTNAME_LEN: usize = 253;

/// Validate that `hostname` is a fully-qualified domain name
///
/// Rules:
/// - Contains at least one `.`
/// - Each label is 1-63 ASCII alphanumeric or hyphen characters
/// - No label starts or ends with a hyphen
/// - At most 253 characters overall
pub fn validate_hostname(hostname: &str) -> Result<(), SupervisorError> {
    if hostname.is_empty() {
        return Err(SupervisorError::Validation(
            "Hostname cannot be empty".to_string(),
        ));
    }

    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(SupervisorError::Validation(format!(
            "Hostname too long (max {} characters): {}",
            MAX_HOSTNAME_LEN,
            hostname.len()
        )));
    }

    if !hostname.contains('.') {
        return Err(SupervisorError::Validation(format!(
            "Hostname must be a full domain (e.g., app.example.com), got '{}'",
            hostname
        )));
    }

    for label in hostname.split('.') {
        validate_label(label, hostname)?;
    }

    Ok(())
}

fn validate_label(label: &str, hostname: &str) -> Result<(), SupervisorError> {
    if label.is_empty() {
        return Err(SupervisorError::Validation(format!(
            "Hostname '{}' contains an empty label",
            hostname
        )));
    }

    if label.len() > MAX_LABEL_LEN {
        return Err(SupervisorError::Validation(format!(
            "Label '{}' too long (max {} characters)",
            label, MAX_LABEL_LEN
        )));
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(SupervisorError::Validation(format!(
            "Label '{}' cannot start or end with hyphen",
            label
        )));
    }

    if let Some(ch) = label
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-')
    {
        return Err(SupervisorError::Validation(format!(
            "Hostname '{}' contains invalid character '{}' (only alphanumeric and hyphens allowed)",
            hostname, ch
        )));
    }

    Ok(())
}

fn validate_service(service: &Service) -> Result<(), SupervisorError> {
    if service.port == 0 {
        return Err(SupervisorError::Validation(
            "Service port must be non-zero".to_string(),
        ));
    }

    match (&service.path, &service.hostname) {
        (Some(path), _) => {
            if !path.starts_with('/') {
                return Err(SupervisorError::Validation(format!(
                    "Service path must start with '/': {}",
                    path
                )));
            }
            Ok(())
        }
        (None, Some(hostname)) => validate_hostname(hostname),
        (None, None) => Err(SupervisorError::Validation(
            "Service needs either a path or a hostname".to_string(),
        )),
    }
}

fn validate_health_check(health_check: &HealthCheckConfig) -> Result<(), SupervisorError> {
    if health_check.interval == 0 {
        return Err(SupervisorError::Validation(
            "Health check interval must be at least 1 second".to_string(),
        ));
    }
    if !health_check.path.starts_with('/') {
        return Err(SupervisorError::Validation(format!(
            "Health check path must start with '/': {}",
            health_check.path
        )));
    }
    Ok(())
}

/// Validate every user-controlled field of a tunnel
pub fn validate_tunnel(tunnel: &Tunnel) -> Result<(), SupervisorError> {
    if tunnel.name.trim().is_empty() {
        return Err(SupervisorError::Validation(
            "Tunnel name cannot be empty".to_string(),
        ));
    }
    if tunnel.zone_id.trim().is_empty() {
        return Err(SupervisorError::Validation(
            "Zone id cannot be empty".to_string(),
        ));
    }
    if tunnel.port == 0 {
        return Err(SupervisorError::Validation(
            "Port must be non-zero".to_string(),
        ));
    }

    validate_hostname(&tunnel.hostname)?;

    for service in &tunnel.services {
        validate_service(service)?;
    }

    validate_health_check(&tunnel.health_check)
}

//! Supervisor error taxonomy

use thiserror::Error;

use crate::provider::ProviderError;
use crate::render::RenderError;
use crate::store::StoreError;

/// Errors surfaced by [`crate::Supervisor`] operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Bad input, rejected before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Tunnel is already running: {0}")]
    AlreadyRunning(String),

    /// Spawning or terminating the external process failed
    #[error("Process error: {0}")]
    Process(String),

    /// The remote provider rejected or failed a request
    #[error("External service error: {0}")]
    ExternalService(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}

impl SupervisorError {
    /// Whether the error was caused by caller input rather than the system
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SupervisorError::Validation(_)
                | SupervisorError::NotFound(_)
                | SupervisorError::AlreadyRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SupervisorError::NotFound("tunnel_abc".to_string());
        assert_eq!(err.to_string(), "Tunnel not found: tunnel_abc");

        let err = SupervisorError::AlreadyRunning("tunnel_abc".to_string());
        assert_eq!(err.to_string(), "Tunnel is already running: tunnel_abc");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(SupervisorError::Validation("bad".into()).is_client_error());
        assert!(SupervisorError::NotFound("x".into()).is_client_error());
        assert!(!SupervisorError::Process("spawn failed".into()).is_client_error());
        assert!(
            !SupervisorError::ExternalService(ProviderError::Api("down".into())).is_client_error()
        );
    }
}

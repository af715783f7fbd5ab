//! Remote tunnel and DNS provisioning interface

use async_trait::async_trait;
use thiserror::Error;

use crate::model::TunnelCredentials;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No provider credentials configured")]
    MissingCredentials,
}

/// Result of provisioning a remote tunnel
#[derive(Debug, Clone)]
pub struct ProvisionedTunnel {
    pub remote_id: String,
    pub credentials: TunnelCredentials,
}

/// Account, tunnel and DNS management at the remote provider
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Create a remote tunnel and return its id and secret material
    async fn provision(&self, name: &str) -> Result<ProvisionedTunnel, ProviderError>;

    async fn deprovision(&self, remote_id: &str) -> Result<(), ProviderError>;

    /// Point `hostname` in `zone_id` at the remote tunnel
    async fn create_route(
        &self,
        zone_id: &str,
        remote_id: &str,
        hostname: &str,
    ) -> Result<(), ProviderError>;

    /// Remove routes for `hostname`, returning how many were deleted
    async fn delete_route(&self, zone_id: &str, hostname: &str) -> Result<usize, ProviderError>;
}

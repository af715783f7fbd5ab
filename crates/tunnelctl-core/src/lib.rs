//! Tunnel supervisor library
//!
//! Owns the lifecycle of external tunnel processes (`cloudflared` by default):
//! renders their configuration, spawns and terminates them, captures their
//! output, probes their health and reconciles persisted state after the
//! supervisor itself restarts.

pub mod cloudflare;
pub mod error;
pub mod health;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod process;
pub mod provider;
pub mod render;
pub mod store;
pub mod supervisor;
pub mod validation;

pub use cloudflare::{CloudflareAuth, CloudflareProvider};
pub use error::SupervisorError;
pub use health::{HealthProber, ProbeOutcome};
pub use logs::{LogEntry, LogLevel, LogSink, LOG_CAPACITY};
pub use metrics::{MetricsRecorder, MetricsSnapshot, TunnelMetrics};
pub use model::{
    Environment, HealthCheckConfig, HealthStatus, Service, Tunnel, TunnelCredentials,
    TunnelDefinition, TunnelPatch, TunnelStats, TunnelStatus,
};
pub use notify::{NoopNotifier, Notifier, NotifyError, TunnelEvent, WebhookNotifier};
pub use process::CommandTemplate;
pub use provider::{ProviderError, ProvisionedTunnel, TunnelProvider};
pub use render::{ArtifactPaths, ConfigRenderer, IngressRule, RenderError};
pub use store::{JsonTunnelStore, MemoryTunnelStore, StoreError, TunnelStore};
pub use supervisor::{
    BulkResult, ReconcileReport, StartOutcome, Supervisor, SupervisorConfig, SupervisorDeps,
    SupervisorEvent, TunnelStatusReport,
};

//! Outbound alerts on tunnel state transitions

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::model::Tunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelEvent {
    Started,
    Stopped,
    Crashed,
    HealthFailed,
}

impl std::fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelEvent::Started => write!(f, "started"),
            TunnelEvent::Stopped => write!(f, "stopped"),
            TunnelEvent::Crashed => write!(f, "crashed"),
            TunnelEvent::HealthFailed => write!(f, "health_failed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook rejected notification with status {0}")]
    Rejected(u16),
}

/// Delivery of tunnel events to operators
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: TunnelEvent, tunnel: &Tunnel) -> Result<(), NotifyError>;
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: TunnelEvent, _tunnel: &Tunnel) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Posts Discord-style embeds to a webhook URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Embed payload for one event
    pub fn payload(event: TunnelEvent, tunnel: &Tunnel) -> Value {
        let field = |name: &str, value: String| json!({"name": name, "value": value, "inline": true});
        let hostname = field("Hostname", tunnel.hostname.clone());

        let (title, description, color, fields) = match event {
            TunnelEvent::Started => (
                "✅ Tunnel Started",
                format!("Tunnel **{}** is now running", tunnel.name),
                3066993,
                vec![
                    hostname,
                    field("Port", tunnel.port.to_string()),
                    field("Environment", tunnel.environment.to_string()),
                ],
            ),
            TunnelEvent::Stopped => (
                "🛑 Tunnel Stopped",
                format!("Tunnel **{}** has been stopped", tunnel.name),
                15158332,
                vec![hostname, field("Environment", tunnel.environment.to_string())],
            ),
            TunnelEvent::Crashed => (
                "💥 Tunnel Crashed",
                format!("Tunnel **{}** has crashed unexpectedly", tunnel.name),
                15158332,
                vec![
                    hostname,
                    field("Environment", tunnel.environment.to_string()),
                    field(
                        "Auto-Restart",
                        if tunnel.auto_restart { "Enabled" } else { "Disabled" }.to_string(),
                    ),
                ],
            ),
            TunnelEvent::HealthFailed => (
                "⚠️ Health Check Failed",
                format!("Health check failed for tunnel **{}**", tunnel.name),
                16776960,
                vec![
                    hostname,
                    field("Port", tunnel.port.to_string()),
                    field(
                        "Action",
                        if tunnel.auto_restart {
                            "Auto-restarting"
                        } else {
                            "No action"
                        }
                        .to_string(),
                    ),
                ],
            ),
        };

        json!({
            "embeds": [{
                "title": title,
                "description": description,
                "color": color,
                "timestamp": Utc::now().to_rfc3339(),
                "fields": fields,
            }]
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: TunnelEvent, tunnel: &Tunnel) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(event, tunnel))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Deliver on a background task; failures are only logged
pub fn dispatch(notifier: &Arc<dyn Notifier>, event: TunnelEvent, tunnel: Tunnel) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(event, &tunnel).await {
            warn!("Failed to send {} notification for {}: {}", event, tunnel.id, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Environment, HealthCheckConfig, TunnelCredentials, TunnelStats, TunnelStatus,
    };
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn tunnel() -> Tunnel {
        Tunnel {
            id: "tunnel_abc".to_string(),
            name: "web".to_string(),
            zone_id: "zone".to_string(),
            remote_id: "remote-1".to_string(),
            hostname: "app.example.com".to_string(),
            port: 3000,
            services: Vec::new(),
            environment: Environment::Staging,
            health_check: HealthCheckConfig::default(),
            auto_restart: true,
            auto_startup: false,
            status: TunnelStatus::Running,
            pid: Some(1),
            pid_fingerprint: None,
            stats: TunnelStats::default(),
            credentials: TunnelCredentials {
                account_tag: "acct".to_string(),
                secret: "s".to_string(),
            },
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_payload_colors() {
        let t = tunnel();
        let color = |event| WebhookNotifier::payload(event, &t)["embeds"][0]["color"].clone();
        assert_eq!(color(TunnelEvent::Started), 3066993);
        assert_eq!(color(TunnelEvent::Stopped), 15158332);
        assert_eq!(color(TunnelEvent::Crashed), 15158332);
        assert_eq!(color(TunnelEvent::HealthFailed), 16776960);
    }

    #[test]
    fn test_payload_fields() {
        let payload = WebhookNotifier::payload(TunnelEvent::HealthFailed, &tunnel());
        let embed = &payload["embeds"][0];
        assert_eq!(
            embed["description"],
            "Health check failed for tunnel **web**"
        );
        assert_eq!(embed["fields"][0]["value"], "app.example.com");
        assert_eq!(embed["fields"][2]["value"], "Auto-restarting");
    }

    #[tokio::test]
    async fn test_webhook_posts_embed() {
        let received: Arc<Mutex<Vec<Value>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        received.lock().unwrap().push(body);
                    },
                ),
            )
            .with_state(received.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = WebhookNotifier::new(format!("http://{}/hook", addr));
        notifier
            .notify(TunnelEvent::Started, &tunnel())
            .await
            .unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["embeds"][0]["title"], "✅ Tunnel Started");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:1/hook");
        assert!(notifier
            .notify(TunnelEvent::Stopped, &tunnel())
            .await
            .is_err());
    }
}

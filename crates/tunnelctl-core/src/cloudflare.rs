//! Cloudflare v4 API provider
//!
//! Tunnels are created under the first account visible to the credentials
//! (or an explicitly configured one) and routed through proxied CNAME records
//! pointing at `<remote_id>.cfargotunnel.com`.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::model::TunnelCredentials;
use crate::provider::{ProviderError, ProvisionedTunnel, TunnelProvider};

pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Credentials accepted by the API
#[derive(Clone)]
pub enum CloudflareAuth {
    /// Scoped API token, sent as a bearer token
    ApiToken(String),
    /// Global API key plus account email
    ApiKey { key: String, email: String },
}

impl std::fmt::Debug for CloudflareAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudflareAuth::ApiToken(_) => write!(f, "ApiToken(<redacted>)"),
            CloudflareAuth::ApiKey { email, .. } => {
                write!(f, "ApiKey {{ email: {:?}, key: <redacted> }}", email)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteTunnel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
}

fn format_errors(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "Unknown error".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 32 random bytes, base64 encoded
fn generate_tunnel_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

pub struct CloudflareProvider {
    client: Client,
    base_url: String,
    auth: CloudflareAuth,
    account_id: OnceCell<String>,
}

impl CloudflareProvider {
    pub fn new(auth: CloudflareAuth) -> Self {
        Self {
            client: Client::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            auth,
            account_id: OnceCell::new(),
        }
    }

    /// Override the API endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a known account instead of discovering one
    pub fn with_account_id(self, account_id: impl Into<String>) -> Self {
        Self {
            account_id: OnceCell::new_with(Some(account_id.into())),
            ..self
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            CloudflareAuth::ApiToken(token) => request.bearer_auth(token),
            CloudflareAuth::ApiKey { key, email } => request
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", key),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let envelope: Envelope<T> = serde_json::from_slice(&body).map_err(|e| {
            ProviderError::Api(format!("Unexpected response (HTTP {}): {}", status, e))
        })?;

        if !envelope.success {
            let message = format_errors(&envelope.errors);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(message),
                _ => ProviderError::Api(message),
            });
        }

        envelope
            .result
            .ok_or_else(|| ProviderError::Api("Response did not contain a result".to_string()))
    }

    /// Account used for tunnel operations, discovered on first use
    pub async fn account_id(&self) -> Result<String, ProviderError> {
        self.account_id
            .get_or_try_init(|| async {
                let accounts: Vec<Account> = self
                    .send(self.client.get(format!("{}/accounts", self.base_url)))
                    .await?;
                let account = accounts
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProviderError::Api("No accounts found".to_string()))?;
                debug!("Using Cloudflare account {}", account.id);
                Ok::<_, ProviderError>(account.id)
            })
            .await
            .cloned()
    }

    /// Check that the configured credentials are accepted
    pub async fn verify(&self) -> Result<String, ProviderError> {
        self.account_id().await
    }
}

#[async_trait]
impl TunnelProvider for CloudflareProvider {
    async fn provision(&self, name: &str) -> Result<ProvisionedTunnel, ProviderError> {
        let account_id = self.account_id().await?;
        let secret = generate_tunnel_secret();

        let tunnel: RemoteTunnel = self
            .send(
                self.client
                    .post(format!(
                        "{}/accounts/{}/cfd_tunnel",
                        self.base_url, account_id
                    ))
                    .json(&json!({
                        "name": name,
                        "tunnel_secret": secret,
                        "config_src": "local",
                    })),
            )
            .await?;

        info!("Provisioned remote tunnel {} ({})", name, tunnel.id);
        Ok(ProvisionedTunnel {
            remote_id: tunnel.id,
            credentials: TunnelCredentials {
                account_tag: account_id,
                secret,
            },
        })
    }

    async fn deprovision(&self, remote_id: &str) -> Result<(), ProviderError> {
        let account_id = self.account_id().await?;
        let _: serde_json::Value = self
            .send(self.client.delete(format!(
                "{}/accounts/{}/cfd_tunnel/{}",
                self.base_url, account_id, remote_id
            )))
            .await?;
        info!("Deleted remote tunnel {}", remote_id);
        Ok(())
    }

    async fn create_route(
        &self,
        zone_id: &str,
        remote_id: &str,
        hostname: &str,
    ) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
                    .json(&json!({
                        "type": "CNAME",
                        "name": hostname,
                        "content": format!("{}.cfargotunnel.com", remote_id),
                        "proxied": true,
                    })),
            )
            .await?;
        info!("Created DNS route {} -> {}", hostname, remote_id);
        Ok(())
    }

    async fn delete_route(&self, zone_id: &str, hostname: &str) -> Result<usize, ProviderError> {
        let records: Vec<DnsRecord> = self
            .send(
                self.client
                    .get(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
                    .query(&[("type", "CNAME"), ("per_page", "100")]),
            )
            .await?;

        let mut deleted = 0;
        for record in records
            .iter()
            .filter(|r| r.record_type == "CNAME" && r.name == hostname)
        {
            let _: serde_json::Value = self
                .send(self.client.delete(format!(
                    "{}/zones/{}/dns_records/{}",
                    self.base_url, zone_id, record.id
                )))
                .await?;
            debug!("Deleted DNS record {} ({})", record.name, record.id);
            deleted += 1;
        }

        if deleted == 0 {
            debug!("No DNS record found matching {}", hostname);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{delete, get, post},
        Json, Router,
    };
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct MockApi {
        calls: Arc<Mutex<Vec<String>>>,
        created: Arc<Mutex<Vec<Value>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Bearer good-token")
            .unwrap_or(false)
            || headers
                .get("x-auth-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "good-key")
                .unwrap_or(false)
    }

    fn ok(result: Value) -> (StatusCode, Json<Value>) {
        (
            StatusCode::OK,
            Json(json!({"success": true, "errors": [], "result": result})),
        )
    }

    fn denied() -> (StatusCode, Json<Value>) {
        (
            StatusCode::FORBIDDEN,
            Json(json!({
                "success": false,
                "errors": [{"code": 10000, "message": "Authentication error"}],
                "result": null
            })),
        )
    }

    async fn accounts(State(api): State<MockApi>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if !authorized(&headers) {
            return denied();
        }
        api.calls.lock().unwrap().push("accounts".to_string());
        ok(json!([{"id": "acct-123", "name": "Main"}]))
    }

    async fn create_tunnel(
        State(api): State<MockApi>,
        Path(account): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        api.calls
            .lock()
            .unwrap()
            .push(format!("create_tunnel:{}:{}", account, body["name"].as_str().unwrap()));
        ok(json!({"id": "remote-uuid-1", "name": body["name"]}))
    }

    async fn delete_tunnel(
        State(api): State<MockApi>,
        Path((account, tunnel)): Path<(String, String)>,
    ) -> (StatusCode, Json<Value>) {
        api.calls
            .lock()
            .unwrap()
            .push(format!("delete_tunnel:{}:{}", account, tunnel));
        ok(json!({"id": tunnel}))
    }

    async fn list_records(Path(_zone): Path<String>) -> (StatusCode, Json<Value>) {
        ok(json!([
            {"id": "r1", "name": "app.example.com", "type": "CNAME", "content": "x.cfargotunnel.com"},
            {"id": "r2", "name": "other.example.com", "type": "CNAME", "content": "y.cfargotunnel.com"},
            {"id": "r3", "name": "app.example.com.evil.com", "type": "CNAME", "content": "z"}
        ]))
    }

    async fn create_record(
        State(api): State<MockApi>,
        Path(_zone): Path<String>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        api.created.lock().unwrap().push(body);
        ok(json!({"id": "new-record"}))
    }

    async fn delete_record(
        State(api): State<MockApi>,
        Path((zone, record)): Path<(String, String)>,
    ) -> (StatusCode, Json<Value>) {
        api.calls
            .lock()
            .unwrap()
            .push(format!("delete_record:{}:{}", zone, record));
        ok(json!({"id": record}))
    }

    async fn start_mock() -> (String, MockApi) {
        let api = MockApi::default();
        let app = Router::new()
            .route("/accounts", get(accounts))
            .route("/accounts/{account}/cfd_tunnel", post(create_tunnel))
            .route(
                "/accounts/{account}/cfd_tunnel/{tunnel}",
                delete(delete_tunnel),
            )
            .route(
                "/zones/{zone}/dns_records",
                get(list_records).post(create_record),
            )
            .route("/zones/{zone}/dns_records/{record}", delete(delete_record))
            .with_state(api.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), api)
    }

    #[test]
    fn test_tunnel_secret_is_32_bytes() {
        let secret = generate_tunnel_secret();
        assert_eq!(STANDARD.decode(&secret).unwrap().len(), 32);
        assert_ne!(secret, generate_tunnel_secret());
    }

    #[test]
    fn test_auth_debug_is_redacted() {
        let auth = CloudflareAuth::ApiToken("super-secret".to_string());
        assert!(!format!("{:?}", auth).contains("super-secret"));
    }

    #[tokio::test]
    async fn test_provision_discovers_account_once() {
        let (base, api) = start_mock().await;
        let provider = CloudflareProvider::new(CloudflareAuth::ApiToken("good-token".to_string()))
            .with_base_url(base);

        let first = provider.provision("web").await.unwrap();
        let second = provider.provision("api").await.unwrap();

        assert_eq!(first.remote_id, "remote-uuid-1");
        assert_eq!(first.credentials.account_tag, "acct-123");
        assert_ne!(first.credentials.secret, second.credentials.secret);

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "accounts".to_string(),
                "create_tunnel:acct-123:web".to_string(),
                "create_tunnel:acct-123:api".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_configured_account_skips_discovery() {
        let (base, api) = start_mock().await;
        let provider = CloudflareProvider::new(CloudflareAuth::ApiKey {
            key: "good-key".to_string(),
            email: "ops@example.com".to_string(),
        })
        .with_base_url(base)
        .with_account_id("acct-fixed");

        provider.deprovision("remote-9").await.unwrap();

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["delete_tunnel:acct-fixed:remote-9".to_string()]);
    }

    #[tokio::test]
    async fn test_create_route_payload() {
        let (base, api) = start_mock().await;
        let provider = CloudflareProvider::new(CloudflareAuth::ApiToken("good-token".to_string()))
            .with_base_url(base);

        provider
            .create_route("zone-1", "remote-uuid-1", "app.example.com")
            .await
            .unwrap();

        let created = api.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["type"], "CNAME");
        assert_eq!(created[0]["name"], "app.example.com");
        assert_eq!(created[0]["content"], "remote-uuid-1.cfargotunnel.com");
        assert_eq!(created[0]["proxied"], true);
    }

    #[tokio::test]
    async fn test_delete_route_matches_exact_name() {
        let (base, api) = start_mock().await;
        let provider = CloudflareProvider::new(CloudflareAuth::ApiToken("good-token".to_string()))
            .with_base_url(base);

        let deleted = provider
            .delete_route("zone-1", "app.example.com")
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let calls = api.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["delete_record:zone-1:r1".to_string()]);

        let none = provider
            .delete_route("zone-1", "missing.example.com")
            .await
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_errors() {
        let (base, _api) = start_mock().await;
        let provider = CloudflareProvider::new(CloudflareAuth::ApiToken("wrong".to_string()))
            .with_base_url(base);

        match provider.verify().await {
            Err(ProviderError::Auth(msg)) => assert!(msg.contains("Authentication error")),
            other => panic!("Expected auth error, got {:?}", other),
        }
    }
}

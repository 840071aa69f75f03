//! # Hub Client
//!
//! JSON-over-HTTPS adapter for [`HubApi`] and [`AuthApi`].
//!
//! ## Endpoints
//! ```text
//! POST v1/devices/tokens            DeviceIdentity        → IssuedToken
//! POST v1/devices/reconnect         {userId, token, device} → RedeemedCode
//! GET  v1/devices/tokens/{token}/validation               → TokenValidation
//! POST v1/health/batches            {phase, records}      → {accepted}
//! POST v1/health/analysis           {phase}               → AnalysisJob
//! GET  v1/health/analysis/{job_id}                        → AnalysisStatus
//! POST v1/auth/sign-in | sign-up    credentials           → session + accessToken
//! GET  v1/auth/session                                    → session
//! POST v1/auth/verification                               → 204
//! PUT  v1/auth/profile              UserProfile           → 204
//! POST v1/auth/sign-out                                   → 204
//! ```
//!
//! Non-2xx answers become [`BridgeError::Server`] carrying the hub's
//! `message` field when it sends one, so `is_retryable` can classify them.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use wellbridge_core::auth::AuthSession;
use wellbridge_core::token::ReconnectCode;
use wellbridge_core::{SyncPhase, UserProfile};

use crate::error::{BridgeError, BridgeResult};
use crate::ports::{
    AnalysisJob, AnalysisStatus, AuthApi, DeviceIdentity, HealthRecord, HubApi, IssuedToken,
    RedeemedCode, TokenValidation,
};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RedeemRequest<'a> {
    user_id: &'a str,
    token: &'a str,
    device: &'a DeviceIdentity,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    phase: SyncPhase,
    records: &'a [HealthRecord],
}

#[derive(Deserialize)]
struct BatchResponse {
    accepted: u64,
}

#[derive(Serialize)]
struct AnalysisRequest {
    phase: SyncPhase,
}

#[derive(Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct SignUpRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(flatten)]
    session: AuthSession,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct VerificationResponse {
    verified: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// HTTP client for the hub.
pub struct HubClient {
    client: Client,
    base: Url,
    access_token: RwLock<Option<String>>,
}

impl HubClient {
    /// Creates a client for `api_url`.
    pub fn new(api_url: &str, timeout: Duration) -> BridgeResult<Self> {
        let mut base = Url::parse(api_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wellbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Internal(format!("HTTP client: {}", e)))?;
        Ok(HubClient {
            client,
            base,
            access_token: RwLock::new(None),
        })
    }

    /// Uses an existing bearer token, e.g. one restored from a keychain.
    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        self.set_access_token(Some(token.into()));
        self
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token.read().map(|t| t.is_some()).unwrap_or(false)
    }

    fn set_access_token(&self, token: Option<String>) {
        match self.access_token.write() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Resolves `path` against the API base.
    pub fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        Ok(self.base.join(path)?)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.read().ok().and_then(|t| t.clone());
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> BridgeResult<T> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let response = self.authorized(self.client.post(url)).json(body).send().await?;
        decode(check(response).await?).await
    }

    async fn post_empty<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> BridgeResult<()> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let response = self.authorized(self.client.post(url)).json(body).send().await?;
        check(response).await.map(|_| ())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> BridgeResult<T> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let response = self.authorized(self.client.get(url)).send().await?;
        decode(check(response).await?).await
    }

    fn accept_session(&self, response: SessionResponse) -> AuthSession {
        if let Some(token) = response.access_token {
            self.set_access_token(Some(token));
        }
        response.session
    }
}

/// Turns non-2xx answers into [`BridgeError::Server`].
async fn check(response: Response) -> BridgeResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    warn!(status = status.as_u16(), message = %message, "Hub returned an error");
    Err(BridgeError::Server {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> BridgeResult<T> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The hub's `message` (or `error`) field, if the body is JSON.
fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed
        .message
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty())
}

#[async_trait]
impl HubApi for HubClient {
    async fn generate_token(&self, device: &DeviceIdentity) -> BridgeResult<IssuedToken> {
        let issued: IssuedToken = self.post("v1/devices/tokens", device).await?;
        info!(device_id = %device.device_id, "Connection token issued");
        Ok(issued)
    }

    async fn redeem_code(
        &self,
        code: &ReconnectCode,
        device: &DeviceIdentity,
    ) -> BridgeResult<RedeemedCode> {
        let request = RedeemRequest {
            user_id: &code.user_id,
            token: &code.token,
            device,
        };
        self.post("v1/devices/reconnect", &request).await
    }

    async fn validation_status(&self, token: &str) -> BridgeResult<TokenValidation> {
        let mut url = self.endpoint("v1/devices/tokens/")?;
        url.path_segments_mut()
            .map_err(|_| BridgeError::Internal("hub URL cannot hold a path".into()))?
            .pop_if_empty()
            .extend([token, "validation"]);
        debug!(%url, "GET");
        let response = self.authorized(self.client.get(url)).send().await?;
        decode(check(response).await?).await
    }

    async fn upload_batch(&self, phase: SyncPhase, records: &[HealthRecord]) -> BridgeResult<u64> {
        let response: BatchResponse = self
            .post("v1/health/batches", &BatchRequest { phase, records })
            .await?;
        Ok(response.accepted)
    }

    async fn request_analysis(&self, phase: SyncPhase) -> BridgeResult<AnalysisJob> {
        self.post("v1/health/analysis", &AnalysisRequest { phase }).await
    }

    async fn analysis_status(&self, job: &AnalysisJob) -> BridgeResult<AnalysisStatus> {
        self.get(&format!("v1/health/analysis/{}", job.job_id)).await
    }
}

#[async_trait]
impl AuthApi for HubClient {
    async fn sign_in(&self, email: &str, password: &str) -> BridgeResult<AuthSession> {
        let response: SessionResponse = self
            .post("v1/auth/sign-in", &SignInRequest { email, password })
            .await?;
        Ok(self.accept_session(response))
    }

    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BridgeResult<AuthSession> {
        let response: SessionResponse = self
            .post(
                "v1/auth/sign-up",
                &SignUpRequest {
                    name,
                    email,
                    password,
                },
            )
            .await?;
        Ok(self.accept_session(response))
    }

    async fn current_session(&self) -> BridgeResult<Option<AuthSession>> {
        if !self.has_access_token() {
            return Ok(None);
        }
        match self.get::<SessionResponse>("v1/auth/session").await {
            Ok(response) => Ok(Some(self.accept_session(response))),
            Err(BridgeError::Server { status: 401, .. }) => {
                self.set_access_token(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_email_verified(&self) -> BridgeResult<bool> {
        let response: VerificationResponse = self.get("v1/auth/verification").await?;
        Ok(response.verified)
    }

    async fn send_verification_email(&self) -> BridgeResult<()> {
        self.post_empty("v1/auth/verification", &serde_json::json!({})).await
    }

    async fn save_profile(&self, profile: &UserProfile) -> BridgeResult<()> {
        let url = self.endpoint("v1/auth/profile")?;
        let response = self.authorized(self.client.put(url)).json(profile).send().await?;
        check(response).await.map(|_| ())
    }

    async fn sign_out(&self) -> BridgeResult<()> {
        let result = self.post_empty("v1/auth/sign-out", &serde_json::json!({})).await;
        self.set_access_token(None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_resolve_under_base_path() {
        let client = HubClient::new("https://hub.example.com/api", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("v1/devices/tokens").unwrap().as_str(),
            "https://hub.example.com/api/v1/devices/tokens"
        );

        let client = HubClient::new("https://hub.example.com/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("v1/health/batches").unwrap().as_str(),
            "https://hub.example.com/api/v1/health/batches"
        );
    }

    #[test]
    fn test_token_validation_wire_format() {
        let validated: TokenValidation = serde_json::from_str(
            r#"{"status":"validated","deviceName":"Ada's Pixel","sessionId":"s-1"}"#,
        )
        .unwrap();
        let signal = validated.into_signal("AB3D9KQ2").unwrap();
        assert!(signal.success);
        assert_eq!(signal.device_name.as_deref(), Some("Ada's Pixel"));
        assert_eq!(signal.token, "AB3D9KQ2");

        let pending: TokenValidation = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert!(pending.into_signal("AB3D9KQ2").is_none());

        let rejected: TokenValidation =
            serde_json::from_str(r#"{"status":"rejected","message":"denied"}"#).unwrap();
        assert!(!rejected.into_signal("AB3D9KQ2").unwrap().success);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"message":"code already used"}"#).as_deref(),
            Some("code already used")
        );
        assert_eq!(error_message(r#"{"error":"expired"}"#).as_deref(), Some("expired"));
        assert_eq!(error_message(r#"{"message":"  "}"#), None);
        assert_eq!(error_message("<html>502</html>"), None);
    }

    #[test]
    fn test_access_token_lifecycle() {
        let client = HubClient::new("https://hub.example.com/api", Duration::from_secs(5)).unwrap();
        assert!(!client.has_access_token());
        let client = client.with_access_token("secret");
        assert!(client.has_access_token());
    }

    #[tokio::test]
    async fn test_unreachable_hub_is_retryable() {
        let client = HubClient::new("http://127.0.0.1:9/api", Duration::from_secs(2)).unwrap();
        let device = DeviceIdentity {
            device_id: "dev-1".into(),
            device_name: "Test".into(),
            platform: wellbridge_core::Platform::Android,
        };
        let err = client.generate_token(&device).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_session_without_token_is_none() {
        let client = HubClient::new("http://127.0.0.1:9/api", Duration::from_secs(2)).unwrap();
        assert!(client.current_session().await.unwrap().is_none());
    }
}

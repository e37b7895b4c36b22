use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::error::{AgentError, ApiError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct DeviceCredentials {
    device_id: String,
    device_token: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    device_id: &'a str,
    device_token: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
}

/// Bearer-token session against the CertHub API.
///
/// Every request goes through [`AuthSession::send`], which attaches the cached
/// access token. A 401 clears the token and, when device credentials are known,
/// triggers exactly one re-authentication and one replay of the request.
pub struct AuthSession {
    client: Client,
    base_url: Url,
    access_token: Mutex<Option<String>>,
    credentials: Mutex<Option<DeviceCredentials>>,
}

impl AuthSession {
    /// Create a session for `base_url` (a trailing slash is added if missing)
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;

        let client = Client::builder()
            .user_agent(concat!("certhub-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            access_token: Mutex::new(None),
            credentials: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for an endpoint path relative to the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    /// Remember the credentials used to re-authenticate after a 401
    pub fn update_credentials(&self, device_id: &str, device_token: &str) {
        let mut credentials = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        *credentials = Some(DeviceCredentials {
            device_id: device_id.to_string(),
            device_token: device_token.to_string(),
        });
    }

    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    /// Exchange device credentials for an access token and cache it
    pub async fn authenticate(&self, device_id: &str, device_token: &str) -> Result<(), AgentError> {
        self.update_credentials(device_id, device_token);
        let token = self
            .request_token(device_id, device_token)
            .await
            .map_err(AgentError::AuthFailure)?;
        self.set_token(Some(token));
        tracing::debug!("Authenticated device {}", device_id);
        Ok(())
    }

    async fn request_token(&self, device_id: &str, device_token: &str) -> Result<String, ApiError> {
        const PATH: &str = "agent/auth";
        let url = self.endpoint(PATH)?;

        let response = self
            .client
            .post(url)
            .json(&AuthRequest {
                device_id,
                device_token,
            })
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                path: PATH.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ApiError::Status {
                path: PATH.to_string(),
                status: response.status(),
            });
        }

        let body: AuthResponse = response.json().await.map_err(|source| ApiError::Decode {
            path: PATH.to_string(),
            source,
        })?;

        body.access_token
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::MissingField {
                path: PATH.to_string(),
                field: "access_token",
            })
    }

    /// Send an authenticated request built by `build`.
    ///
    /// `build` may run twice: once for the original request and once for the
    /// replay after re-authentication. Non-2xx responses are returned as-is.
    pub async fn send<F>(&self, path: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.send_once(path, &build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.set_token(None);
        let credentials = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(credentials) = credentials else {
            return Ok(response);
        };

        tracing::warn!("Bearer token rejected for {}; re-authenticating", path);
        match self
            .request_token(&credentials.device_id, &credentials.device_token)
            .await
        {
            Ok(token) => self.set_token(Some(token)),
            Err(e) => {
                tracing::warn!("Re-authentication failed: {}", e);
                return Ok(response);
            }
        }

        self.send_once(path, &build).await
    }

    async fn send_once<F>(&self, path: &str, build: &F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.client);
        if let Some(token) = self.token() {
            request = request.bearer_auth(token);
        }

        request.send().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })
    }

    fn token(&self) -> Option<String> {
        self.access_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.access_token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }
}

/// Parse a base URL and make sure it ends in `/` so joins keep its path
pub fn normalize_base_url(raw: &str) -> Result<Url, ApiError> {
    let trimmed = raw.trim().trim_end_matches('/');
    Ok(Url::parse(&format!("{}/", trimmed))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_auth(server: &MockServer, token: &str, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/auth"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "access_token": token })),
            )
            .up_to_n_times(times)
            .mount(server)
            .await;
    }

    fn session_for(server: &MockServer) -> AuthSession {
        AuthSession::new(&format!("{}/api/v1", server.uri())).unwrap()
    }

    #[test]
    fn base_url_keeps_api_prefix() {
        let url = normalize_base_url("https://certhub.example.com/api/v1/").unwrap();
        assert_eq!(url.as_str(), "https://certhub.example.com/api/v1/");
        assert_eq!(
            url.join("agent/jobs").unwrap().as_str(),
            "https://certhub.example.com/api/v1/agent/jobs"
        );
        assert!(normalize_base_url("not a url").is_err());
    }

    #[tokio::test]
    async fn authenticate_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/auth"))
            .and(body_json(serde_json::json!({
                "device_id": "dev-1",
                "device_token": "secret"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "access_token": "tok-1" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate("dev-1", "secret").await.unwrap();
        assert!(session.has_token());
    }

    #[tokio::test]
    async fn authenticate_failure_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/auth"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let session = session_for(&server);
        let err = session.authenticate("dev-1", "bad").await.unwrap_err();
        assert!(matches!(err, AgentError::AuthFailure(ApiError::Status { .. })));
        assert!(!session.has_token());
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/auth"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = session_for(&server).authenticate("dev-1", "x").await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::AuthFailure(ApiError::MissingField { field: "access_token", .. })
        ));
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_reauth_and_replay() {
        let server = MockServer::start().await;
        mount_auth(&server, "old", 1).await;
        mount_auth(&server, "new", 1).await;

        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.authenticate("dev-1", "secret").await.unwrap();

        let url = session.endpoint("agent/jobs").unwrap();
        let response = session
            .send("agent/jobs", |client| client.get(url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_reauth_returns_original_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/auth"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let session = session_for(&server);
        session.update_credentials("dev-1", "revoked");
        session.set_token(Some("stale".to_string()));

        let url = session.endpoint("agent/jobs").unwrap();
        let response = session
            .send("agent/jobs", |client| client.get(url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!session.has_token());
    }

    #[tokio::test]
    async fn unauthorized_without_credentials_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let session = session_for(&server);
        let url = session.endpoint("agent/jobs").unwrap();
        let response = session
            .send("agent/jobs", |client| client.get(url.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

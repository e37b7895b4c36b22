use chrono::{DateTime, Local, Utc};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::cleanup::CleanupResult;
use super::report::InstalledCertsReport;
use super::session::AuthSession;
use crate::error::ApiError;
use crate::retention::RetentionMode;

/// Version reported in heartbeats
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server-side lifecycle state of an install job
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum JobStatus {
    Requested,
    Pending,
    InProgress,
    Done,
    Failed,
    Expired,
    Canceled,
    Other(String),
}

impl From<String> for JobStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "REQUESTED" => JobStatus::Requested,
            "PENDING" => JobStatus::Pending,
            "IN_PROGRESS" => JobStatus::InProgress,
            "DONE" => JobStatus::Done,
            "FAILED" => JobStatus::Failed,
            "EXPIRED" => JobStatus::Expired,
            "CANCELED" => JobStatus::Canceled,
            _ => JobStatus::Other(raw),
        }
    }
}

impl JobStatus {
    /// The job is waiting for this agent to claim it
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Requested)
    }

    /// The job still needs work, either by us or in flight
    pub fn is_active(&self) -> bool {
        self.is_claimable() || *self == JobStatus::InProgress
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallJob {
    pub id: String,
    pub status: JobStatus,
}

/// A claimed job's certificate, as delivered by the payload endpoint
#[derive(Clone, Deserialize)]
pub struct CertificatePayload {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub cert_id: Option<String>,
    pub pfx_base64: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleanup_mode: RetentionMode,
    #[serde(default)]
    pub keep_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub keep_reason: Option<String>,
}

// Keep the PFX password and bytes out of logs.
impl fmt::Debug for CertificatePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePayload")
            .field("job_id", &self.job_id)
            .field("cert_id", &self.cert_id)
            .field("source_path", &self.source_path)
            .field("generated_at", &self.generated_at)
            .field("cleanup_mode", &self.cleanup_mode)
            .field("keep_until", &self.keep_until)
            .finish_non_exhaustive()
    }
}

/// Claim responses carry the token either in an object or as a bare string
#[derive(Deserialize)]
#[serde(untagged)]
enum ClaimResponse {
    Object { payload_token: Option<String> },
    Bare(String),
}

/// Terminal outcome posted to `agent/jobs/{id}/result`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn done(thumbprint: String) -> Self {
        Self {
            status: "DONE",
            thumbprint: Some(thumbprint),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(error_code: &'static str, error_message: impl Into<String>) -> Self {
        Self {
            status: "FAILED",
            thumbprint: None,
            error_code: Some(error_code),
            error_message: Some(error_message.into()),
        }
    }
}

/// Audit record posted to `agent/cleanup`
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub mode: String,
    pub ran_at: String,
    pub removed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub removed_thumbprints: Vec<String>,
    pub failed_thumbprints: Vec<String>,
    pub skipped_thumbprints: Vec<String>,
}

impl From<&CleanupResult> for CleanupReport {
    fn from(result: &CleanupResult) -> Self {
        Self {
            mode: result.mode.to_string(),
            ran_at: result.ran_at.with_timezone(&Local).to_rfc3339(),
            removed_count: result.removed.len(),
            failed_count: result.failed.len(),
            skipped_count: result.skipped.len(),
            removed_thumbprints: result.removed.clone(),
            failed_thumbprints: result.failed.clone(),
            skipped_thumbprints: result.skipped.clone(),
        }
    }
}

#[derive(Serialize)]
struct Heartbeat<'a> {
    agent_version: &'a str,
}

/// Typed client for the agent endpoints
pub struct AgentApi {
    session: AuthSession,
}

impl AgentApi {
    pub fn new(session: AuthSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub async fn heartbeat(&self) -> Result<(), ApiError> {
        self.post_json("agent/heartbeat", &Heartbeat {
            agent_version: AGENT_VERSION,
        })
        .await
        .map(drop)
    }

    pub async fn list_jobs(&self) -> Result<Vec<InstallJob>, ApiError> {
        const PATH: &str = "agent/jobs";
        let url = self.session.endpoint(PATH)?;
        let response = self.session.send(PATH, |client| client.get(url.clone())).await?;
        decode(PATH, expect_success(PATH, response)?).await
    }

    /// Claim a job and return its payload token
    pub async fn claim_job(&self, job_id: &str) -> Result<String, ApiError> {
        let path = format!("agent/jobs/{}/claim", job_id);
        let response = self.post_json(&path, &serde_json::json!({})).await?;

        match decode::<ClaimResponse>(&path, response).await? {
            ClaimResponse::Object {
                payload_token: Some(token),
            }
            | ClaimResponse::Bare(token)
                if !token.is_empty() =>
            {
                Ok(token)
            }
            _ => Err(ApiError::MissingField {
                path,
                field: "payload_token",
            }),
        }
    }

    pub async fn fetch_payload(&self, job_id: &str, token: &str) -> Result<CertificatePayload, ApiError> {
        let path = format!("agent/jobs/{}/payload", job_id);
        let mut url = self.session.endpoint(&path)?;
        url.query_pairs_mut().append_pair("token", token);

        let response = self.session.send(&path, |client| client.get(url.clone())).await?;
        decode(&path, expect_success(&path, response)?).await
    }

    pub async fn report_result(&self, job_id: &str, result: &JobResult) -> Result<(), ApiError> {
        let path = format!("agent/jobs/{}/result", job_id);
        self.post_json(&path, result).await.map(drop)
    }

    pub async fn report_cleanup(&self, report: &CleanupReport) -> Result<(), ApiError> {
        self.post_json("agent/cleanup", report).await.map(drop)
    }

    pub async fn report_installed_certs(&self, report: &InstalledCertsReport) -> Result<(), ApiError> {
        self.post_json("agent/installed-certs", report).await.map(drop)
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<Response, ApiError> {
        let url = self.session.endpoint(path)?;
        let response = self
            .session
            .send(path, |client| client.post(url.clone()).json(body))
            .await?;
        expect_success(path, response)
    }
}

fn expect_success(path: &str, response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ApiError::Status {
            path: path.to_string(),
            status: response.status(),
        })
    }
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T, ApiError> {
    response.json().await.map_err(|source| ApiError::Decode {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_for(server: &MockServer) -> AgentApi {
        AgentApi::new(AuthSession::new(&format!("{}/api/v1", server.uri())).unwrap())
    }

    #[test]
    fn job_status_parses_known_and_unknown_values() {
        assert_eq!(JobStatus::from("pending".to_string()), JobStatus::Pending);
        assert_eq!(JobStatus::from("IN_PROGRESS".to_string()), JobStatus::InProgress);
        assert_eq!(
            JobStatus::from("ARCHIVED".to_string()),
            JobStatus::Other("ARCHIVED".to_string())
        );
        assert!(JobStatus::Requested.is_claimable());
        assert!(!JobStatus::InProgress.is_claimable());
        assert!(JobStatus::InProgress.is_active());
        assert!(!JobStatus::Other("ARCHIVED".to_string()).is_active());
    }

    #[test]
    fn payload_defaults_unknown_cleanup_mode() {
        let payload: CertificatePayload = serde_json::from_value(serde_json::json!({
            "job_id": "job-1",
            "pfx_base64": "AAAA",
            "password": "pw",
            "cleanup_mode": "SOMETIMES",
            "keep_until": null
        }))
        .unwrap();
        assert_eq!(payload.cleanup_mode, RetentionMode::Default);
        assert!(payload.keep_until.is_none());
        assert!(!format!("{:?}", payload).contains("pw"));
    }

    #[test]
    fn job_result_omits_empty_fields() {
        let done = serde_json::to_value(JobResult::done("AA11".to_string())).unwrap();
        assert_eq!(done, serde_json::json!({ "status": "DONE", "thumbprint": "AA11" }));

        let failed = serde_json::to_value(JobResult::failed("PAYLOAD_FAILED", "Failed to fetch payload")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({
                "status": "FAILED",
                "error_code": "PAYLOAD_FAILED",
                "error_message": "Failed to fetch payload"
            })
        );
    }

    #[tokio::test]
    async fn list_jobs_decodes_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "a", "status": "PENDING" },
                { "id": "b", "status": "DONE", "extra": 1 }
            ])))
            .mount(&server)
            .await;

        let jobs = api_for(&server).list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[1].id, "b");
    }

    #[tokio::test]
    async fn claim_accepts_object_and_bare_string() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/jobs/a/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "a",
                "status": "IN_PROGRESS",
                "payload_token": "tok-a"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/jobs/b/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!("tok-b")))
            .mount(&server)
            .await;

        let api = api_for(&server);
        assert_eq!(api.claim_job("a").await.unwrap(), "tok-a");
        assert_eq!(api.claim_job("b").await.unwrap(), "tok-b");
    }

    #[tokio::test]
    async fn claim_conflict_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/jobs/a/claim"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let err = api_for(&server).claim_job("a").await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn fetch_payload_sends_token_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/jobs/a/payload"))
            .and(query_param("token", "tok a+b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job_id": "a",
                "pfx_base64": "AAAA",
                "password": "pw",
                "cleanup_mode": "KEEP_UNTIL",
                "keep_until": "2030-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let payload = api_for(&server).fetch_payload("a", "tok a+b").await.unwrap();
        assert_eq!(payload.cleanup_mode, RetentionMode::KeepUntil);
        assert!(payload.keep_until.is_some());
    }

    #[tokio::test]
    async fn heartbeat_posts_agent_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/heartbeat"))
            .and(body_json(serde_json::json!({ "agent_version": AGENT_VERSION })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        api_for(&server).heartbeat().await.unwrap();
    }
}

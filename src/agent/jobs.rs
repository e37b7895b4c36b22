use chrono::Utc;
use rand::Rng;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::api::{AgentApi, CertificatePayload, JobResult};
use super::installer::CertificateInstaller;
use super::scheduler::sleep_or_cancel;
use super::state::{JobPhase, StatusEvent, StatusHandle};
use crate::error::HttpFailure;
use crate::platform::tasks::{TaskScheduler, keep_until_task_args, keep_until_task_name};
use crate::retention::RetentionMode;

const PAYLOAD_FAILED_MESSAGE: &str = "Failed to fetch payload";

/// Retry budget for payload downloads
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Fetch attempts shared by rate-limit retries and re-claims
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to every delay (0.2 = ±20%)
    pub jitter: f64,
    pub reclaim_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            reclaim_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after a 429 on the given attempt (0-based)
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Apply uniform ±jitter to `delay`
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

/// How a single job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { thumbprint: String },
    /// Another agent claimed it first (409); nothing reported
    AlreadyClaimed,
    ClaimFailed,
    PayloadFailed,
    InstallFailed,
    /// Shutdown interrupted a backoff; nothing reported
    Canceled,
}

enum Fetched {
    Payload(CertificatePayload),
    Failed,
    Canceled,
}

struct KeepUntilTasks {
    scheduler: Arc<dyn TaskScheduler>,
    executable: PathBuf,
}

/// Runs one job through claim, payload download, install, and report
pub struct JobProcessor {
    installer: CertificateInstaller,
    status: StatusHandle,
    retry: RetryPolicy,
    keep_until_tasks: Option<KeepUntilTasks>,
}

impl JobProcessor {
    pub fn new(installer: CertificateInstaller, status: StatusHandle, retry: RetryPolicy) -> Self {
        Self {
            installer,
            status,
            retry,
            keep_until_tasks: None,
        }
    }

    /// Register one-shot cleanup tasks for KEEP_UNTIL installs
    pub fn with_keep_until_tasks(mut self, scheduler: Arc<dyn TaskScheduler>, executable: PathBuf) -> Self {
        self.keep_until_tasks = Some(KeepUntilTasks {
            scheduler,
            executable,
        });
        self
    }

    pub async fn process(&self, api: &AgentApi, job_id: &str, cancel: &CancellationToken) -> JobOutcome {
        tracing::info!("Processing job {}", job_id);
        self.phase(job_id, JobPhase::Claiming);

        let token = match api.claim_job(job_id).await {
            Ok(token) => token,
            Err(e) if e.status() == Some(StatusCode::CONFLICT) => {
                tracing::info!("Job {} already claimed elsewhere", job_id);
                return JobOutcome::AlreadyClaimed;
            }
            Err(e) => {
                tracing::warn!("Claim failed for job {}: {}", job_id, e);
                self.phase(job_id, JobPhase::ClaimFailed);
                self.status.record(StatusEvent::Error(e.to_string()));
                return JobOutcome::ClaimFailed;
            }
        };
        self.phase(job_id, JobPhase::PayloadTokenReady);

        let payload = match self.fetch_payload(api, job_id, token, cancel).await {
            Fetched::Payload(payload) => payload,
            Fetched::Canceled => {
                tracing::info!("Job {} interrupted by shutdown", job_id);
                return JobOutcome::Canceled;
            }
            Fetched::Failed => {
                self.report(api, job_id, &JobResult::failed("PAYLOAD_FAILED", PAYLOAD_FAILED_MESSAGE))
                    .await;
                self.phase(job_id, JobPhase::PayloadFailed);
                self.status
                    .record(StatusEvent::Error(PAYLOAD_FAILED_MESSAGE.to_string()));
                return JobOutcome::PayloadFailed;
            }
        };

        tracing::debug!(?payload, "Payload received for job {}", job_id);

        match self.installer.install(job_id, &payload) {
            Ok(thumbprint) => {
                self.schedule_keep_until(&payload, &thumbprint);
                self.report(api, job_id, &JobResult::done(thumbprint.clone())).await;
                self.phase(job_id, JobPhase::Done);
                tracing::info!("Job {} done ({})", job_id, thumbprint);
                JobOutcome::Done { thumbprint }
            }
            Err(e) => {
                tracing::error!("Install failed for job {}: {}", job_id, e);
                self.report(api, job_id, &JobResult::failed("INSTALL_FAILED", e.to_string()))
                    .await;
                self.phase(job_id, JobPhase::Failed);
                self.status.record(StatusEvent::Error(e.to_string()));
                JobOutcome::InstallFailed
            }
        }
    }

    async fn fetch_payload(
        &self,
        api: &AgentApi,
        job_id: &str,
        mut token: String,
        cancel: &CancellationToken,
    ) -> Fetched {
        let mut attempt = 0;

        while attempt < self.retry.max_attempts {
            let error = match api.fetch_payload(job_id, &token).await {
                Ok(payload) => return Fetched::Payload(payload),
                Err(e) => e,
            };

            match error.classify() {
                HttpFailure::RateLimited => {
                    let delay = self.retry.jittered(self.retry.rate_limit_delay(attempt));
                    tracing::warn!(
                        "Payload rate limited for job {}. Retrying in {:.1}s",
                        job_id,
                        delay.as_secs_f64()
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Fetched::Canceled;
                    }
                }
                HttpFailure::TokenRejected => {
                    tracing::warn!("Payload token rejected for job {} ({}). Re-claiming", job_id, error);
                    if !sleep_or_cancel(self.retry.jittered(self.retry.reclaim_delay), cancel).await {
                        return Fetched::Canceled;
                    }
                    match api.claim_job(job_id).await {
                        Ok(fresh) => {
                            token = fresh;
                            self.phase(job_id, JobPhase::PayloadTokenRefreshed);
                        }
                        Err(e) => {
                            tracing::warn!("Re-claim failed for job {}: {}", job_id, e);
                            return Fetched::Failed;
                        }
                    }
                }
                _ => {
                    tracing::error!("Payload fetch failed for job {}: {}", job_id, error);
                    return Fetched::Failed;
                }
            }

            attempt += 1;
        }

        tracing::error!(
            "Payload fetch for job {} gave up after {} attempts",
            job_id,
            self.retry.max_attempts
        );
        Fetched::Failed
    }

    fn schedule_keep_until(&self, payload: &CertificatePayload, thumbprint: &str) {
        let Some(tasks) = &self.keep_until_tasks else {
            return;
        };
        if payload.cleanup_mode != RetentionMode::KeepUntil {
            return;
        }
        let Some(at) = payload.keep_until.filter(|at| *at > Utc::now()) else {
            return;
        };

        let name = keep_until_task_name(thumbprint);
        if let Err(e) = tasks.scheduler.ensure_one_shot_task(
            &name,
            at,
            &tasks.executable,
            &keep_until_task_args(&name),
        ) {
            tracing::warn!("Failed to schedule KEEP_UNTIL cleanup for {}: {:#}", thumbprint, e);
        }
    }

    async fn report(&self, api: &AgentApi, job_id: &str, result: &JobResult) {
        if let Err(e) = api.report_result(job_id, result).await {
            tracing::warn!("Result update failed for job {}: {}", job_id, e);
        }
    }

    fn phase(&self, job_id: &str, phase: JobPhase) {
        self.status.record(StatusEvent::Job {
            id: job_id.to_string(),
            phase,
        });
    }
}

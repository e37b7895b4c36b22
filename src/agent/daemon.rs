use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::AgentApi;
use super::cleanup::{CleanupEngine, CleanupMode, report_cleanup};
use super::installer::CertificateInstaller;
use super::jobs::{JobProcessor, RetryPolicy};
use super::report::send_snapshot;
use super::scheduler::{PollingScheduler, sleep_or_cancel};
use super::session::AuthSession;
use super::state::{StatusEvent, StatusHandle};
use crate::config::{AgentConfig, AgentPaths};
use crate::error::ApiError;
use crate::platform::tasks::{TaskScheduler, native_task_scheduler};
use crate::platform::trust_store::{FileTrustStore, TrustStore};
use crate::retention::RetentionStore;
use crate::seal::{LocalKeySeal, SecretSeal, load_secret_string};

/// Wait before re-reading configuration that is missing or invalid
pub const CONFIG_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Wait before retrying a failed authentication
pub const AUTH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Local hour after which a missed daily cleanup is run by the agent itself
pub const FALLBACK_CLEANUP_HOUR: u32 = 18;

/// Long-lived components shared by every run of the agent loop
pub struct AgentServices {
    pub paths: AgentPaths,
    pub seal: Arc<dyn SecretSeal>,
    pub trust_store: Arc<dyn TrustStore>,
    pub registry: RetentionStore,
    pub status: StatusHandle,
    pub retry: RetryPolicy,
    pub task_scheduler: Option<Arc<dyn TaskScheduler>>,
    pub executable: Option<PathBuf>,
}

impl AgentServices {
    /// Open the on-disk state under `paths` with the platform defaults
    pub fn open(paths: AgentPaths) -> Result<Self> {
        let seal: Arc<dyn SecretSeal> = Arc::new(
            LocalKeySeal::open_or_create(&paths.seal_key_file()).context("Failed to open the local seal")?,
        );
        let trust_store: Arc<dyn TrustStore> =
            Arc::new(FileTrustStore::open(paths.cert_store_dir(), seal.clone())?);
        let registry = RetentionStore::new(paths.registry_file(), seal.clone());

        Ok(Self {
            paths,
            seal,
            trust_store,
            registry,
            status: StatusHandle::new(),
            retry: RetryPolicy::default(),
            task_scheduler: Some(Arc::from(native_task_scheduler())),
            executable: std::env::current_exe().ok(),
        })
    }

    pub fn cleanup_engine(&self) -> CleanupEngine {
        CleanupEngine::new(self.registry.clone(), self.trust_store.clone())
    }

    fn job_processor(&self) -> JobProcessor {
        let installer = CertificateInstaller::new(self.trust_store.clone(), self.registry.clone());
        let processor = JobProcessor::new(installer, self.status.clone(), self.retry.clone());

        match (&self.task_scheduler, &self.executable) {
            (Some(scheduler), Some(executable)) => {
                processor.with_keep_until_tasks(scheduler.clone(), executable.clone())
            }
            _ => processor,
        }
    }
}

/// A missed daily cleanup is due once it is past 18:00 locally and none
/// has succeeded today
pub fn should_run_fallback(now_local: NaiveDateTime, last_cleanup: Option<NaiveDate>) -> bool {
    now_local.hour() >= FALLBACK_CLEANUP_HOUR && last_cleanup != Some(now_local.date())
}

/// The agent's outer and inner polling loops
pub struct AgentLoop {
    services: Arc<AgentServices>,
    processor: JobProcessor,
    cleanup: CleanupEngine,
    api: Option<(String, Arc<AgentApi>)>,
    fallback_attempted_on: Option<NaiveDate>,
}

impl AgentLoop {
    pub fn new(services: Arc<AgentServices>) -> Self {
        Self {
            processor: services.job_processor(),
            cleanup: services.cleanup_engine(),
            services,
            api: None,
            fallback_attempted_on: None,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Agent loop started");

        while !cancel.is_cancelled() {
            let Some((config, device_token)) = self.load_settings() else {
                if !sleep_or_cancel(CONFIG_RETRY_DELAY, &cancel).await {
                    break;
                }
                continue;
            };

            let api = match self.client_for(&config.api_base_url) {
                Ok(api) => api,
                Err(e) => {
                    tracing::error!("Cannot create API client: {:#}", e);
                    self.services
                        .status
                        .record(StatusEvent::Error("Invalid API URL".to_string()));
                    if !sleep_or_cancel(CONFIG_RETRY_DELAY, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = api.session().authenticate(&config.device_id, &device_token).await {
                tracing::error!("Failed to authenticate device: {}", e);
                self.services
                    .status
                    .record(StatusEvent::Error("Auth failed".to_string()));
                if !sleep_or_cancel(AUTH_RETRY_DELAY, &cancel).await {
                    break;
                }
                continue;
            }
            self.services.status.record(StatusEvent::ClearError);
            tracing::info!("Authenticated as device {}", config.device_id);

            send_snapshot(
                &api,
                &config.device_id,
                self.services.trust_store.as_ref(),
                &self.services.registry,
            )
            .await;

            self.poll(&api, &config, &cancel).await;
        }

        tracing::info!("Agent loop stopped");
    }

    async fn poll(&mut self, api: &AgentApi, config: &AgentConfig, cancel: &CancellationToken) {
        let (active, idle) = config.polling_intervals();
        let mut scheduler = PollingScheduler::new(active, idle);
        let mut last_heartbeat: Option<Instant> = None;

        self.record_polling(&scheduler);

        while !cancel.is_cancelled() {
            let heartbeat_due = last_heartbeat
                .map(|at| at.elapsed() >= scheduler.heartbeat_period())
                .unwrap_or(true);
            if heartbeat_due {
                last_heartbeat = Some(Instant::now());
                self.heartbeat(api).await;
                self.fallback_cleanup_if_due(api, Local::now().naive_local()).await;
            }

            let mut has_active_work = false;
            match api.list_jobs().await {
                Ok(jobs) => {
                    has_active_work = jobs.iter().any(|job| job.status.is_active());
                    if let Some(job) = jobs.iter().find(|job| job.status.is_claimable()) {
                        self.processor.process(api, &job.id, cancel).await;
                    }
                }
                Err(e) => {
                    tracing::error!("Job polling failed: {}", e);
                    self.services
                        .status
                        .record(StatusEvent::Error("Polling failed".to_string()));
                }
            }

            scheduler.next(has_active_work);
            self.record_polling(&scheduler);

            if cancel.is_cancelled() || !scheduler.sleep(cancel).await {
                break;
            }
        }
    }

    async fn heartbeat(&self, api: &AgentApi) {
        match api.heartbeat().await {
            Ok(()) => self
                .services
                .status
                .record(StatusEvent::HeartbeatSucceeded(Utc::now())),
            Err(e @ ApiError::Status { .. }) => {
                tracing::warn!("Heartbeat failed: {}", e);
                self.services
                    .status
                    .record(StatusEvent::Error("Heartbeat failed".to_string()));
            }
            Err(e) => {
                tracing::error!("Heartbeat error: {}", e);
                self.services
                    .status
                    .record(StatusEvent::Error("Heartbeat error".to_string()));
            }
        }
    }

    async fn fallback_cleanup_if_due(&mut self, api: &AgentApi, now_local: NaiveDateTime) {
        let config_path = self.services.paths.config_file();
        let last_cleanup = match AgentConfig::load(&config_path) {
            Ok(Some(config)) => config.last_cleanup_local_date,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Skipping fallback cleanup check: {:#}", e);
                return;
            }
        };

        let today = now_local.date();
        if !should_run_fallback(now_local, last_cleanup) || self.fallback_attempted_on == Some(today) {
            return;
        }
        self.fallback_attempted_on = Some(today);

        tracing::info!("Fallback cleanup triggered (after 18:00 and not run today)");
        let result = match self.cleanup.run(CleanupMode::Fallback) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Fallback cleanup aborted: {:#}", e);
                return;
            }
        };

        if result.success() {
            if let Err(e) = AgentConfig::record_cleanup_date(&config_path, today) {
                tracing::error!("Failed to record cleanup date: {:#}", e);
            }
        }

        report_cleanup(api, &result).await;
    }

    fn load_settings(&self) -> Option<(AgentConfig, String)> {
        let config = match AgentConfig::load(&self.services.paths.config_file()) {
            Ok(Some(config)) => config,
            Ok(None) => {
                tracing::debug!("Agent is not configured yet");
                return None;
            }
            Err(e) => {
                tracing::warn!("{:#}", e);
                return None;
            }
        };

        if let Err(e) = config.validate() {
            tracing::warn!("{}", e);
            return None;
        }

        let token = load_secret_string(self.services.seal.as_ref(), &self.services.paths.secrets_file())
            .filter(|token| !token.trim().is_empty());
        let Some(token) = token else {
            tracing::debug!("No device token stored yet");
            return None;
        };

        Some((config, token))
    }

    /// Reuse the client while the base URL is unchanged (case-insensitive)
    fn client_for(&mut self, base_url: &str) -> Result<Arc<AgentApi>> {
        let key = base_url.trim().to_ascii_lowercase();
        if let Some((current, api)) = &self.api {
            if *current == key {
                return Ok(api.clone());
            }
        }

        let api = Arc::new(AgentApi::new(AuthSession::new(base_url)?));
        tracing::info!("Using API at {}", api.session().base_url());
        self.api = Some((key, api.clone()));
        Ok(api)
    }

    fn record_polling(&self, scheduler: &PollingScheduler) {
        self.services.status.record(StatusEvent::Polling {
            interval: scheduler.interval(),
            mode: scheduler.mode(),
        });
    }
}

/// Starts and stops the background agent loop
pub struct AgentController {
    services: Arc<AgentServices>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl AgentController {
    pub fn new(services: AgentServices) -> Self {
        Self {
            services: Arc::new(services),
            running: None,
        }
    }

    pub fn status(&self) -> &StatusHandle {
        &self.services.status
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawn the loop unless it is already running
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let cancel = CancellationToken::new();
        let agent = AgentLoop::new(self.services.clone());
        let handle = tokio::spawn(agent.run(cancel.clone()));
        self.running = Some((cancel, handle));
    }

    /// Cancel the loop and wait for it to unwind
    pub async fn stop(&mut self) {
        let Some((cancel, handle)) = self.running.take() else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Agent loop ended abnormally: {}", e);
        }
    }

    pub async fn restart(&mut self) {
        self.stop().await;
        self.start();
    }
}

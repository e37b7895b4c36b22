use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Where a job stands from the agent's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Claiming,
    PayloadTokenReady,
    PayloadTokenRefreshed,
    ClaimFailed,
    PayloadFailed,
    Done,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Claiming => "CLAIMING",
            JobPhase::PayloadTokenReady => "PAYLOAD_TOKEN_READY",
            JobPhase::PayloadTokenRefreshed => "PAYLOAD_TOKEN_REFRESHED",
            JobPhase::ClaimFailed => "CLAIM_FAILED",
            JobPhase::PayloadFailed => "PAYLOAD_FAILED",
            JobPhase::Done => "DONE",
            JobPhase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingMode {
    #[default]
    Active,
    Idle,
}

impl fmt::Display for PollingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollingMode::Active => f.write_str("active"),
            PollingMode::Idle => f.write_str("idle"),
        }
    }
}

/// Snapshot of what the agent is doing. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStatus {
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<String>,
    pub last_job_status: Option<JobPhase>,
    pub polling_interval: Option<Duration>,
    pub polling_mode: PollingMode,
    pub last_error: Option<String>,
}

/// Something that happened and should be reflected in [`AgentStatus`]
#[derive(Debug, Clone)]
pub enum StatusEvent {
    HeartbeatSucceeded(DateTime<Utc>),
    Job { id: String, phase: JobPhase },
    Polling { interval: Duration, mode: PollingMode },
    Error(String),
    ClearError,
}

impl AgentStatus {
    /// Apply one event
    pub fn apply(&mut self, event: StatusEvent) {
        match event {
            StatusEvent::HeartbeatSucceeded(at) => {
                self.last_heartbeat_at = Some(at);
                self.last_error = None;
            }
            StatusEvent::Job { id, phase } => {
                self.last_job_id = Some(id);
                self.last_job_status = Some(phase);
                if phase == JobPhase::Done {
                    self.last_error = None;
                }
            }
            StatusEvent::Polling { interval, mode } => {
                self.polling_interval = Some(interval);
                self.polling_mode = mode;
            }
            StatusEvent::Error(message) => self.last_error = Some(message),
            StatusEvent::ClearError => self.last_error = None,
        }
    }
}

/// Shared writer for the agent status; observers subscribe to changes
#[derive(Clone)]
pub struct StatusHandle {
    sender: watch::Sender<AgentStatus>,
}

impl StatusHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(AgentStatus::default());
        Self { sender }
    }

    pub fn record(&self, event: StatusEvent) {
        self.sender.send_modify(|status| status.apply(event));
    }

    pub fn snapshot(&self) -> AgentStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.sender.subscribe()
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_phases_use_wire_names() {
        assert_eq!(JobPhase::PayloadTokenRefreshed.to_string(), "PAYLOAD_TOKEN_REFRESHED");
        assert_eq!(JobPhase::ClaimFailed.to_string(), "CLAIM_FAILED");
        assert_eq!(JobPhase::Done.to_string(), "DONE");
    }

    #[test]
    fn errors_clear_only_on_success_events() {
        let handle = StatusHandle::new();
        handle.record(StatusEvent::Error("Polling failed".to_string()));
        handle.record(StatusEvent::Polling {
            interval: Duration::from_secs(8),
            mode: PollingMode::Idle,
        });
        assert_eq!(handle.snapshot().last_error.as_deref(), Some("Polling failed"));

        handle.record(StatusEvent::HeartbeatSucceeded(Utc::now()));
        let status = handle.snapshot();
        assert!(status.last_error.is_none());
        assert!(status.last_heartbeat_at.is_some());
        assert_eq!(status.polling_mode, PollingMode::Idle);
    }

    #[test]
    fn job_events_track_latest_job() {
        let handle = StatusHandle::new();
        handle.record(StatusEvent::Job {
            id: "job-1".to_string(),
            phase: JobPhase::Claiming,
        });
        handle.record(StatusEvent::Job {
            id: "job-1".to_string(),
            phase: JobPhase::PayloadFailed,
        });

        let status = handle.snapshot();
        assert_eq!(status.last_job_id.as_deref(), Some("job-1"));
        assert_eq!(status.last_job_status, Some(JobPhase::PayloadFailed));
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let handle = StatusHandle::new();
        let mut receiver = handle.subscribe();

        handle.record(StatusEvent::Error("Auth failed".to_string()));
        receiver.changed().await.unwrap();
        assert_eq!(receiver.borrow().last_error.as_deref(), Some("Auth failed"));
    }
}

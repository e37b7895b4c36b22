use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;

use crate::agent::{AgentController, AgentServices, AuthSession};
use crate::config::{AgentConfig, AgentPaths};
use crate::platform::tasks::{DAILY_TASK_NAME, native_task_scheduler};
use crate::retention::{RetentionMode, RetentionStore};
use crate::seal::{LocalKeySeal, SecretSeal, load_secret_string, save_secret_string};

use super::utils::format_duration;

/// Pairing parameters collected by `certhub-agent setup`
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub api_url: String,
    pub device_id: String,
    pub device_token: String,
    pub portal_url: Option<String>,
    pub active_interval: Option<u64>,
    pub idle_interval: Option<u64>,
}

/// Pair this device and register the daily cleanup task
pub fn setup(paths: &AgentPaths, request: SetupRequest) -> Result<()> {
    println!("CertHub Agent - Setup");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Testing authentication against {}...", request.api_url.trim());
    let runtime = tokio::runtime::Runtime::new()?;
    let config = runtime.block_on(pair(paths, &request))?;
    println!("✓ Device authenticated");
    println!("✓ Configuration saved to: {}", paths.config_file().display());

    let executable = std::env::current_exe().context("Failed to locate the agent executable")?;
    match native_task_scheduler().ensure_daily_task(&executable) {
        Ok(()) => println!("✓ Daily cleanup task registered ({})", DAILY_TASK_NAME),
        Err(e) => {
            tracing::warn!("Failed to register daily cleanup task: {:#}", e);
            println!("! Daily cleanup task not registered; the agent will clean up after 18:00 while running");
        }
    }

    println!();
    println!("Agent configured successfully!");
    if let Some(portal) = config.resolve_portal_url() {
        println!("Portal: {}", portal);
    }
    println!();
    println!("Next steps:");
    println!("  certhub-agent run");

    Ok(())
}

/// Validate, authenticate and persist the pairing; the token is sealed at rest
async fn pair(paths: &AgentPaths, request: &SetupRequest) -> Result<AgentConfig> {
    // Keep the record of the last daily cleanup across re-pairing
    let previous = AgentConfig::load(&paths.config_file()).ok().flatten();

    let mut config = AgentConfig::new(&request.api_url, &request.device_id);
    config.portal_url = request.portal_url.clone();
    if let Some(active) = request.active_interval {
        config.polling_interval_seconds_active = active;
    }
    if let Some(idle) = request.idle_interval {
        config.polling_interval_seconds_idle = idle;
    }
    if let Some(previous) = previous {
        config.last_cleanup_local_date = previous.last_cleanup_local_date;
        config.log_level = previous.log_level;
    }

    config.validate().context("Invalid configuration")?;

    let token = request.device_token.trim();
    let session = AuthSession::new(&config.api_base_url)?;
    session
        .authenticate(&config.device_id, token)
        .await
        .context("Authentication failed")?;

    let seal = LocalKeySeal::open_or_create(&paths.seal_key_file())?;
    save_secret_string(&seal, &paths.secrets_file(), token).context("Failed to store device token")?;
    config.save(&paths.config_file())?;

    Ok(config)
}

/// Run the agent in the foreground until Ctrl+C
pub fn run(paths: AgentPaths) -> Result<()> {
    let services = AgentServices::open(paths)?;

    if let (Some(scheduler), Some(executable)) = (&services.task_scheduler, &services.executable) {
        if let Err(e) = scheduler.ensure_daily_task(executable) {
            tracing::warn!("Failed to register daily cleanup task: {:#}", e);
        }
    }

    tracing::info!("Starting CertHub agent v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut controller = AgentController::new(services);

        let mut updates = controller.status().subscribe();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let status = updates.borrow_and_update().clone();
                tracing::debug!(?status, "Agent status changed");
            }
        });

        controller.start();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;

        tracing::info!("Shutting down");
        controller.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Show configuration and the certificates the agent is tracking
pub fn status(paths: &AgentPaths) -> Result<()> {
    println!("CertHub Agent Status");
    println!("====================");
    println!();
    println!("State directory: {}", paths.root().display());

    let Some(config) = AgentConfig::load(&paths.config_file())? else {
        println!("Status: Not configured");
        println!();
        println!("Run: certhub-agent setup --api-url <URL> --device-id <ID> --device-token <TOKEN>");
        return Ok(());
    };

    let (active, idle) = config.polling_intervals();
    println!("API: {}", config.api_base_url);
    println!("Device: {}", config.device_id);
    if let Some(portal) = config.resolve_portal_url() {
        println!("Portal: {}", portal);
    }
    println!("Polling: {}s active, up to {}s idle", active, idle);
    match config.last_cleanup_local_date {
        Some(date) => println!("Last daily cleanup: {}", date),
        None => println!("Last daily cleanup: never"),
    }

    // Do not mint a seal key just to report that nothing is stored
    if !paths.seal_key_file().exists() {
        println!("Device token: not stored");
        return Ok(());
    }

    let seal: Arc<dyn SecretSeal> = Arc::new(LocalKeySeal::open_or_create(&paths.seal_key_file())?);
    match load_secret_string(seal.as_ref(), &paths.secrets_file()) {
        Some(_) => println!("Device token: stored"),
        None => println!("Device token: not stored"),
    }

    let entries = RetentionStore::new(paths.registry_file(), seal).load_normalized();
    println!();
    println!("Installed certificates: {}", entries.len());

    let now = Utc::now();
    for entry in &entries {
        let retention = match (entry.cleanup_mode, entry.keep_until) {
            (RetentionMode::KeepUntil, Some(until)) if until > now => {
                format!("KEEP_UNTIL {} (in {})", until.to_rfc3339(), format_duration(until - now))
            }
            (RetentionMode::KeepUntil, Some(until)) => {
                format!("KEEP_UNTIL {} (expired)", until.to_rfc3339())
            }
            (mode, _) => mode.as_str().to_string(),
        };

        println!("  {}  {}", entry.thumbprint, retention);
        if let Some(job_id) = &entry.job_id {
            println!("      job: {}", job_id);
        }
        if let Some(reason) = &entry.keep_reason {
            println!("      reason: {}", reason);
        }
    }

    Ok(())
}

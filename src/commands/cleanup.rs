use anyhow::Result;
use chrono::Local;

use crate::agent::{AgentApi, AgentServices, AuthSession, CleanupMode, CleanupResult, report_cleanup};
use crate::config::{AgentConfig, AgentPaths};
use crate::platform::tasks::native_task_scheduler;
use crate::seal::{SecretSeal, load_secret_string};

/// Run one cleanup pass and return the process exit code.
///
/// The one-shot task named by `task_name` is deleted whatever the outcome.
pub fn run_cleanup(paths: &AgentPaths, mode: CleanupMode, task_name: Option<&str>) -> i32 {
    let outcome = cleanup_once(paths, mode);

    if let Some(name) = task_name {
        match native_task_scheduler().delete_task(name) {
            Ok(()) => tracing::info!("Deleted one-shot task {}", name),
            Err(e) => tracing::warn!("Failed to delete one-shot task {}: {:#}", name, e),
        }
    }

    match outcome {
        Ok(result) if result.success() => 0,
        Ok(result) => {
            eprintln!("{} certificate(s) could not be removed", result.failed.len());
            1
        }
        Err(e) => {
            tracing::error!("Cleanup aborted: {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn cleanup_once(paths: &AgentPaths, mode: CleanupMode) -> Result<CleanupResult> {
    let services = AgentServices::open(paths.clone())?;
    let result = services.cleanup_engine().run(mode)?;

    if result.success() && mode.records_daily_run() {
        let today = Local::now().date_naive();
        if let Err(e) = AgentConfig::record_cleanup_date(&paths.config_file(), today) {
            tracing::warn!("Could not record cleanup date: {:#}", e);
        }
    }

    println!(
        "Cleanup ({}): {} in scope, {} removed, {} skipped, {} failed",
        mode,
        result.total_in_scope,
        result.removed.len(),
        result.skipped.len(),
        result.failed.len()
    );

    report(paths, services.seal.as_ref(), &result);
    Ok(result)
}

/// Send the audit record when the device is paired; never fails the run
fn report(paths: &AgentPaths, seal: &dyn SecretSeal, result: &CleanupResult) {
    let config = match AgentConfig::load(&paths.config_file()) {
        Ok(Some(config)) if config.validate().is_ok() => config,
        _ => {
            tracing::info!("Cleanup audit skipped: agent is not configured");
            return;
        }
    };
    let Some(token) = load_secret_string(seal, &paths.secrets_file()) else {
        tracing::info!("Cleanup audit skipped: no device token");
        return;
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::warn!("Cleanup audit skipped: {}", e);
            return;
        }
    };

    runtime.block_on(async {
        let session = match AuthSession::new(&config.api_base_url) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Cleanup audit skipped: {:#}", e);
                return;
            }
        };
        if let Err(e) = session.authenticate(&config.device_id, &token).await {
            tracing::warn!("Cleanup audit skipped: {}", e);
            return;
        }
        report_cleanup(&AgentApi::new(session), result).await;
    });
}

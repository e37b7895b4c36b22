use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

#[cfg(any(target_os = "windows", target_os = "linux"))]
use anyhow::Context;

/// Name of the daily cleanup task
pub const DAILY_TASK_NAME: &str = "certhub-agent-cleanup-18h";

/// Local hour the daily cleanup runs at
pub const DAILY_CLEANUP_HOUR: u32 = 18;

/// OS-level registration of cleanup runs
pub trait TaskScheduler: Send + Sync {
    /// Register (or refresh) the daily `--cleanup --mode scheduled` run
    fn ensure_daily_task(&self, executable: &Path) -> Result<()>;

    /// Register a single run of `executable args...` at `at`
    fn ensure_one_shot_task(
        &self,
        name: &str,
        at: DateTime<Utc>,
        executable: &Path,
        args: &[String],
    ) -> Result<()>;

    fn delete_task(&self, name: &str) -> Result<()>;
}

/// Task name for the one-shot cleanup of a KEEP_UNTIL certificate
pub fn keep_until_task_name(thumbprint: &str) -> String {
    format!("certhub-agent-keep-until-{}", thumbprint.to_ascii_lowercase())
}

/// Arguments for a one-shot KEEP_UNTIL cleanup that removes its own task
pub fn keep_until_task_args(task_name: &str) -> Vec<String> {
    vec![
        "--cleanup".to_string(),
        "--mode".to_string(),
        "keep_until".to_string(),
        "--task-name".to_string(),
        task_name.to_string(),
    ]
}

/// Scheduler backed by the platform's native mechanism
pub fn native_task_scheduler() -> Box<dyn TaskScheduler> {
    #[cfg(target_os = "windows")]
    {
        Box::new(SchtasksScheduler)
    }

    #[cfg(target_os = "linux")]
    {
        Box::new(SystemdUserScheduler)
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        Box::new(UnsupportedScheduler)
    }
}

#[cfg(any(target_os = "windows", target_os = "linux"))]
fn run_command(program: &str, args: &[String]) -> Result<()> {
    tracing::debug!("Running {} {}", program, args.join(" "));

    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} failed: {}", program, error.trim());
    }

    Ok(())
}

/// Windows Task Scheduler via schtasks.exe
#[cfg(target_os = "windows")]
pub struct SchtasksScheduler;

#[cfg(target_os = "windows")]
impl SchtasksScheduler {
    fn task_command(executable: &Path, args: &[String]) -> String {
        format!("\"{}\" {}", executable.display(), command_line(args))
    }
}

/// Join arguments the way the Windows command line parser splits them
#[cfg(any(target_os = "windows", test))]
fn command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(any(target_os = "windows", test))]
fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Task Scheduler definition for a single run of `executable args...` at `at`.
///
/// `StartBoundary` is ISO-8601 with an explicit offset, so the run time does
/// not depend on the system's short-date format.
#[cfg(any(target_os = "windows", test))]
fn one_shot_task_xml(at: DateTime<Utc>, executable: &Path, args: &[String]) -> String {
    // StartBoundary has second precision; round up so the run never lands before `at`
    let start = (at + chrono::Duration::seconds(1)).with_timezone(&chrono::Local);

    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>CertHub agent KEEP_UNTIL cleanup</Description>
  </RegistrationInfo>
  <Triggers>
    <TimeTrigger>
      <StartBoundary>{start}</StartBoundary>
      <Enabled>true</Enabled>
    </TimeTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <StartWhenAvailable>true</StartWhenAvailable>
    <Enabled>true</Enabled>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
      <Arguments>{arguments}</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
        start = start.format("%Y-%m-%dT%H:%M:%S%:z"),
        command = xml_escape(&executable.display().to_string()),
        arguments = xml_escape(&command_line(args)),
    )
}

/// schtasks only reads task XML reliably as UTF-16 with a byte order mark
#[cfg(any(target_os = "windows", test))]
fn utf16_le_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

#[cfg(target_os = "windows")]
impl TaskScheduler for SchtasksScheduler {
    fn ensure_daily_task(&self, executable: &Path) -> Result<()> {
        let args: Vec<String> = vec![
            "/Create".into(),
            "/F".into(),
            "/SC".into(),
            "DAILY".into(),
            "/ST".into(),
            format!("{:02}:00", DAILY_CLEANUP_HOUR),
            "/TN".into(),
            DAILY_TASK_NAME.into(),
            "/TR".into(),
            Self::task_command(executable, &["--cleanup".into(), "--mode".into(), "scheduled".into()]),
        ];
        run_command("schtasks", &args).context("Failed to register daily cleanup task")?;
        tracing::info!("Scheduled task ensured: {}", DAILY_TASK_NAME);
        Ok(())
    }

    fn ensure_one_shot_task(
        &self,
        name: &str,
        at: DateTime<Utc>,
        executable: &Path,
        args: &[String],
    ) -> Result<()> {
        let xml_path = std::env::temp_dir().join(format!("{}.xml", name));
        std::fs::write(&xml_path, utf16_le_with_bom(&one_shot_task_xml(at, executable, args)))
            .with_context(|| format!("Failed to write task definition: {}", xml_path.display()))?;

        let create: Vec<String> = vec![
            "/Create".into(),
            "/F".into(),
            "/TN".into(),
            name.into(),
            "/XML".into(),
            xml_path.display().to_string(),
        ];
        let result = run_command("schtasks", &create);
        if let Err(e) = std::fs::remove_file(&xml_path) {
            tracing::debug!("Could not remove {}: {}", xml_path.display(), e);
        }
        result.with_context(|| format!("Failed to register one-shot task {}", name))?;

        tracing::info!("One-shot task {} scheduled for {}", name, at.to_rfc3339());
        Ok(())
    }

    fn delete_task(&self, name: &str) -> Result<()> {
        let args: Vec<String> = vec!["/Delete".into(), "/F".into(), "/TN".into(), name.into()];
        run_command("schtasks", &args).with_context(|| format!("Failed to delete task {}", name))
    }
}

/// systemd user timers created with systemd-run
#[cfg(target_os = "linux")]
pub struct SystemdUserScheduler;

/// Stop only the timer: a `--cleanup --task-name` run executes inside the
/// matching service, and `--collect` unloads that service once it exits
#[cfg(any(target_os = "linux", test))]
fn systemd_stop_timer_args(name: &str) -> Vec<String> {
    vec![
        "--user".to_string(),
        "stop".to_string(),
        format!("{}.timer", name),
    ]
}

#[cfg(any(target_os = "linux", test))]
fn systemd_run_args(name: &str, calendar: &str, executable: &Path, args: &[String]) -> Vec<String> {
    let mut command = vec![
        "--user".to_string(),
        format!("--unit={}", name),
        format!("--on-calendar={}", calendar),
        "--timer-property=Persistent=true".to_string(),
        "--collect".to_string(),
        executable.display().to_string(),
    ];
    command.extend(args.iter().cloned());
    command
}

#[cfg(target_os = "linux")]
impl SystemdUserScheduler {
    fn stop_timer(name: &str) {
        if let Err(e) = run_command("systemctl", &systemd_stop_timer_args(name)) {
            tracing::debug!("Ignoring stop failure for {}: {:#}", name, e);
        }
    }

    fn register(name: &str, calendar: &str, executable: &Path, args: &[String]) -> Result<()> {
        Self::stop_timer(name);
        run_command("systemd-run", &systemd_run_args(name, calendar, executable, args))
    }
}

#[cfg(target_os = "linux")]
impl TaskScheduler for SystemdUserScheduler {
    fn ensure_daily_task(&self, executable: &Path) -> Result<()> {
        let calendar = format!("*-*-* {:02}:00:00", DAILY_CLEANUP_HOUR);
        let args = vec!["--cleanup".to_string(), "--mode".to_string(), "scheduled".to_string()];
        Self::register(DAILY_TASK_NAME, &calendar, executable, &args)
            .context("Failed to register daily cleanup timer")?;
        tracing::info!("Scheduled task ensured: {}", DAILY_TASK_NAME);
        Ok(())
    }

    fn ensure_one_shot_task(
        &self,
        name: &str,
        at: DateTime<Utc>,
        executable: &Path,
        args: &[String],
    ) -> Result<()> {
        let calendar = at.format("%Y-%m-%d %H:%M:%S UTC").to_string();
        Self::register(name, &calendar, executable, args)
            .with_context(|| format!("Failed to register one-shot timer {}", name))?;
        tracing::info!("One-shot task {} scheduled for {}", name, calendar);
        Ok(())
    }

    fn delete_task(&self, name: &str) -> Result<()> {
        Self::stop_timer(name);
        Ok(())
    }
}

/// Platforms without a supported scheduler: log and carry on
#[cfg(not(any(target_os = "windows", target_os = "linux")))]
pub struct UnsupportedScheduler;

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
impl TaskScheduler for UnsupportedScheduler {
    fn ensure_daily_task(&self, _executable: &Path) -> Result<()> {
        tracing::warn!("Scheduled cleanup is not supported on this platform; relying on fallback cleanup");
        Ok(())
    }

    fn ensure_one_shot_task(
        &self,
        name: &str,
        _at: DateTime<Utc>,
        _executable: &Path,
        _args: &[String],
    ) -> Result<()> {
        tracing::warn!("Cannot schedule one-shot task {} on this platform", name);
        Ok(())
    }

    fn delete_task(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

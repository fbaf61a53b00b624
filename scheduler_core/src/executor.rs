//! Runs a task's (or condition's) script body as a child process.

use crate::account::ensure_may_switch_to;
use crate::error::SchedulerResult;
use crate::model::TriggerReason;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub outcome: Outcome,
    pub log: String,
}

pub struct ExecutionRequest<'a> {
    pub task_id: i64,
    pub task_name: &'a str,
    pub account: &'a str,
    pub script_body: &'a str,
    pub trigger: TriggerReason,
    pub timeout: Duration,
    /// Whether the spawned process should switch to `account` before exec.
    /// Condition checks run through the command-building path only and
    /// never switch account (§4.5); task runs always do.
    pub switch_account: bool,
}

/// Runs `request.script_body` as a child process under `request.account`,
/// capturing combined stdout+stderr and enforcing `request.timeout`.
///
/// Any failure to even start the process (missing account, insufficient
/// privilege, spawn error) is folded into a `Failed` outcome with the
/// error message as the log, matching §4.4's "never surfaced synchronously"
/// contract — the caller always gets an `ExecutionOutput`, never an `Err`.
pub async fn run(request: ExecutionRequest<'_>) -> ExecutionOutput {
    match run_inner(&request).await {
        Ok(output) => output,
        Err(e) => ExecutionOutput {
            outcome: Outcome::Failed,
            log: e.to_string(),
        },
    }
}

async fn run_inner(request: &ExecutionRequest<'_>) -> SchedulerResult<ExecutionOutput> {
    let switching_account = if request.switch_account {
        let current_account = crate::account::current_account_name()?;
        let switching_account = request.account != current_account;
        if switching_account {
            ensure_may_switch_to(request.account)?;
        }
        switching_account
    } else {
        false
    };

    let mut command = build_command(request.script_body);
    command
        .env("SCHEDULER_TASK_ID", request.task_id.to_string())
        .env("SCHEDULER_TASK_NAME", request.task_name)
        .env("SCHEDULER_TASK_ACCOUNT", request.account)
        .env("SCHEDULER_TRIGGER", request.trigger.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    if switching_account {
        apply_account_switch(&mut command, request.account)?;
    }

    let child = command.spawn()?;
    let timeout_secs = request.timeout.as_secs();
    match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            let log = log.trim().to_owned();
            let outcome = if output.status.success() {
                Outcome::Success
            } else {
                Outcome::Failed
            };
            Ok(ExecutionOutput { outcome, log })
        }
        Ok(Err(e)) => Ok(ExecutionOutput {
            outcome: Outcome::Failed,
            log: format!("failed to run process: {e}"),
        }),
        Err(_) => {
            warn!(task_id = request.task_id, "script timed out after {timeout_secs}s");
            Ok(ExecutionOutput {
                outcome: Outcome::Failed,
                log: format!("timed out after {timeout_secs}s"),
            })
        }
    }
}

#[cfg(unix)]
fn build_command(script_body: &str) -> Command {
    let mut command = Command::new("/bin/bash");
    command.arg("-c").arg(script_body);
    command
}

#[cfg(windows)]
fn build_command(script_body: &str) -> Command {
    let mut command = Command::new("powershell");
    command
        .arg("-NoLogo")
        .arg("-NonInteractive")
        .arg("-ExecutionPolicy")
        .arg("Bypass")
        .arg("-Command")
        .arg(script_body);
    command
}

/// Installs a pre-exec hook performing the setgid → setgroups → setuid
/// sequence required by §4.3, and sets `HOME` to the target account's home
/// directory. Runs only in the forked child, before exec.
#[cfg(unix)]
fn apply_account_switch(command: &mut Command, account: &str) -> SchedulerResult<()> {
    use std::os::unix::process::CommandExt;

    let info = crate::account::resolve_account(account)?;
    command.env("HOME", &info.home_dir);

    let uid = info.uid;
    let gid = info.gid;
    let groups: Vec<libc::gid_t> = info.supplementary_gids;

    // SAFETY: the closure runs in the forked child between fork and exec,
    // before any other threads exist there; only async-signal-safe libc
    // calls are made. Group membership must be dropped before the uid.
    unsafe {
        command.pre_exec(move || {
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(windows)]
fn apply_account_switch(_command: &mut Command, _account: &str) -> SchedulerResult<()> {
    Ok(())
}

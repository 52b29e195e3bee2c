//! Host command execution.
//!
//! All shell-outs go through a [`CommandRunner`] so orchestration logic stays
//! testable with a scripted runner.  [`ProcessRunner`] is the real thing:
//! it runs commands with `tokio::process`, bounds each one with a timeout and
//! prefixes privileged invocations with the configured root helper (skipped
//! when already running as root).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::error::{RbdError, Result};

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes host commands.  A non-zero exit is an error.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with the caller's privileges.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run `program` with elevated privileges.
    async fn run_as_root(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    root_helper: Vec<String>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(root_helper: Vec<String>, timeout: Duration) -> Self {
        Self {
            root_helper,
            timeout,
        }
    }

    pub fn from_config(host: &HostConfig) -> Self {
        Self::new(host.root_helper.clone(), host.command_timeout())
    }

    async fn execute(&self, argv: Vec<String>) -> Result<CommandOutput> {
        let command_line = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(RbdError::InvalidArgument("empty command line".into()));
        };

        debug!(command = %command_line, "running host command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RbdError::CommandFailed {
                    command: command_line,
                    code: None,
                    stderr: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command_line, timeout = ?self.timeout, "host command timed out");
                return Err(RbdError::CommandFailed {
                    command: command_line,
                    code: None,
                    stderr: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(RbdError::CommandFailed {
                command: command_line,
                code: output.status.code(),
                stderr: stderr.trim().to_owned(),
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

fn argv(prefix: &[String], program: &str, args: &[&str]) -> Vec<String> {
    prefix
        .iter()
        .cloned()
        .chain(std::iter::once(program.to_owned()))
        .chain(args.iter().map(|a| (*a).to_owned()))
        .collect()
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.execute(argv(&[], program, args)).await
    }

    async fn run_as_root(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let prefix: &[String] = if nix::unistd::geteuid().is_root() {
            &[]
        } else {
            &self.root_helper
        };
        self.execute(argv(prefix, program, args)).await
    }
}

/// Point `link` at `target`, replacing whatever is at `link` already.
pub async fn symlink_force(runner: &dyn CommandRunner, target: &Path, link: &Path) -> Result<()> {
    let target = target.to_string_lossy();
    let link = link.to_string_lossy();
    runner
        .run_as_root("ln", &["--symbolic", "--force", "--no-dereference", &*target, &*link])
        .await?;
    Ok(())
}

/// Remove `path`; a missing path is not an error.
pub async fn remove_force(runner: &dyn CommandRunner, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    runner.run_as_root("rm", &["--force", &*path]).await?;
    Ok(())
}

use std::process::{Output, Stdio};
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;

use crate::ui::prelude::*;

pub mod deps;
pub mod logging;

use self::logging::CommandLogger;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}){}", captured_output(.stdout, .stderr))]
    Failed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

fn captured_output(stdout: &str, stderr: &str) -> String {
    let mut text = String::new();
    if !stdout.trim().is_empty() {
        text.push_str(&format!("\nstdout: {}", stdout.trim()));
    }
    if !stderr.trim().is_empty() {
        text.push_str(&format!("\nstderr: {}", stderr.trim()));
    }
    text
}

/// Runs host tools on behalf of the image pipeline.
///
/// Output is captured by default so failures carry the tool's own
/// diagnostics. With `verbose` the child inherits the terminal instead. In
/// dry-run mode nothing is spawned: every command is printed and appended to
/// a journal, and calls that would produce output return `None`.
pub struct CommandExecutor {
    pub dry_run: bool,
    verbose: bool,
    logger: Option<CommandLogger>,
    journal: Mutex<Vec<String>>,
    #[cfg(test)]
    fail_on: Option<String>,
}

impl CommandExecutor {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            verbose: false,
            logger: None,
            journal: Mutex::new(Vec::new()),
            #[cfg(test)]
            fail_on: None,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_logger(mut self, logger: CommandLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Dry-run only: make every invocation of `program` fail.
    #[cfg(test)]
    pub fn failing_on(mut self, program: &str) -> Self {
        self.fail_on = Some(program.to_string());
        self
    }

    pub async fn run(&self, command: &mut Command) -> Result<(), ExecError> {
        let line = describe(command);
        if self.dry_run {
            return self.record_dry_run(command, line);
        }

        emit(Level::Debug, "exec.run", &format!("$ {line}"), None);
        command.kill_on_drop(true).stdin(Stdio::null());

        if self.verbose {
            let status = command
                .status()
                .await
                .map_err(|source| ExecError::Spawn {
                    command: line.clone(),
                    source,
                })?;
            if !status.success() {
                return Err(ExecError::Failed {
                    command: line,
                    status: status.to_string(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            return Ok(());
        }

        self.capture(command, line).await.map(|_| ())
    }

    /// Runs the command and returns its stdout, or `None` in dry-run mode.
    pub async fn run_with_output(&self, command: &mut Command) -> Result<Option<String>, ExecError> {
        let line = describe(command);
        if self.dry_run {
            self.record_dry_run(command, line)?;
            return Ok(None);
        }

        emit(Level::Debug, "exec.run", &format!("$ {line}"), None);
        command.kill_on_drop(true).stdin(Stdio::null());
        let output = self.capture(command, line).await?;
        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }

    /// Commands seen so far in dry-run mode, in order.
    pub fn journal(&self) -> Vec<String> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    async fn capture(&self, command: &mut Command, line: String) -> Result<Output, ExecError> {
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                command: line.clone(),
                source,
            })?;

        if let Some(logger) = &self.logger {
            let std = command.as_std();
            let program = std.get_program().to_string_lossy().to_string();
            let args: Vec<String> = std
                .get_args()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            if let Err(e) = logger.log_command(&program, &args, &output) {
                emit(
                    Level::Debug,
                    "exec.log_failed",
                    &format!("Could not record command log: {e}"),
                    None,
                );
            }
        }

        if !output.status.success() {
            return Err(ExecError::Failed {
                command: line,
                status: output.status.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output)
    }

    fn record_dry_run(&self, command: &Command, line: String) -> Result<(), ExecError> {
        emit(Level::Info, "exec.dry_run", &format!("[DRY RUN] {line}"), None);
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(line.clone());
        }

        if let Some(err) = self.injected_failure(command, &line) {
            return Err(err);
        }

        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self, command: &Command, line: &str) -> Option<ExecError> {
        let program = self.fail_on.as_deref()?;
        if command.as_std().get_program() != program {
            return None;
        }
        Some(ExecError::Failed {
            command: line.to_string(),
            status: "exit status: 1".to_string(),
            stdout: String::new(),
            stderr: format!("{program}: injected failure"),
        })
    }

    #[cfg(not(test))]
    fn injected_failure(&self, _command: &Command, _line: &str) -> Option<ExecError> {
        None
    }
}

/// Rendering of a command used in logs, errors and the journal.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let program = std.get_program().to_string_lossy();
    let args: Vec<_> = std.get_args().map(|a| a.to_string_lossy()).collect();
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

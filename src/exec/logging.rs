use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::PathBuf;

use crate::paths;

const LOG_FILE_NAME: &str = "commands.jsonl";

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandLog {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

/// Appends one JSON line per executed host tool while `--debug` is active.
#[derive(Debug, Clone)]
pub struct CommandLogger {
    log_dir: PathBuf,
}

impl CommandLogger {
    pub fn new() -> Result<Self> {
        Ok(Self::in_dir(paths::command_logs_dir()?))
    }

    pub fn in_dir(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_command(
        &self,
        command: &str,
        args: &[String],
        output: &std::process::Output,
    ) -> Result<()> {
        if !crate::ui::is_debug_enabled() {
            return Ok(());
        }

        create_dir_all(&self.log_dir).context("Failed to create command log directory")?;

        let log_entry = CommandLog {
            timestamp: Utc::now(),
            command: command.to_string(),
            args: args.to_vec(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_path())
            .context("Failed to open command log file")?;

        let json_line =
            serde_json::to_string(&log_entry).context("Failed to serialize command log")?;
        writeln!(file, "{json_line}").context("Failed to write to command log file")?;

        Ok(())
    }

    fn log_file_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    /// Newest entries first.
    pub fn get_logs(&self) -> Result<Vec<CommandLog>> {
        let log_file = self.log_file_path();
        if !log_file.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&log_file).context("Failed to read command log")?;

        let mut logs = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let log: CommandLog =
                serde_json::from_str(line).context("Failed to parse command log entry")?;
            logs.push(log);
        }

        logs.reverse();
        Ok(logs)
    }

    pub fn clear_logs(&self) -> Result<()> {
        let log_file = self.log_file_path();
        if log_file.exists() {
            std::fs::remove_file(&log_file).context("Failed to remove command log")?;
        }
        Ok(())
    }

    pub fn print_recent_logs(&self, limit: usize) -> Result<()> {
        use crate::ui::prelude::*;

        let logs = self.get_logs()?;

        if logs.is_empty() {
            emit(
                Level::Info,
                "logs.empty",
                "No command logs found. Run a build with --debug to record them.",
                None,
            );
            return Ok(());
        }

        emit(Level::Info, "logs.list.start", "Recent host commands:", None);
        separator();

        for (i, log) in logs.iter().take(limit).enumerate() {
            let time_str = log.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string();
            let mut text_block = format!(
                "#{} {}  {} {}\n",
                i + 1,
                time_str,
                log.command,
                log.args.join(" ")
            );
            match log.exit_code {
                Some(code) => text_block.push_str(&format!("   exit code: {code}\n")),
                None => text_block.push_str("   terminated by signal\n"),
            }
            if !log.stderr.trim().is_empty() {
                text_block.push_str(&format!("   stderr:\n{}\n", indent_text(&log.stderr, 5)));
            }

            let data = serde_json::json!({
                "index": i + 1,
                "timestamp": time_str,
                "command": log.command,
                "args": log.args,
                "success": log.success,
                "exit_code": log.exit_code,
                "stdout": log.stdout,
                "stderr": log.stderr,
            });
            let level = if log.success { Level::Info } else { Level::Warn };
            emit(level, "logs.entry", text_block.trim_end(), Some(data));
        }
        separator();

        Ok(())
    }
}

fn indent_text(text: &str, indent: usize) -> String {
    let indent_str = " ".repeat(indent);
    text.lines()
        .map(|line| format!("{indent_str}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

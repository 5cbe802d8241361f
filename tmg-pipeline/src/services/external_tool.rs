//! External command runner
//!
//! TOA extraction, fitting and (optionally) epoch reading are delegated to
//! command-line tools configured as templates in the global config. A
//! template is split on whitespace and `{placeholder}` tokens are replaced
//! per argument, so substituted paths never go through a shell.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// External tool errors
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Command template is empty")]
    EmptyCommand,

    #[error("Unknown placeholder {{{0}}} in command template")]
    UnknownPlaceholder(String),

    #[error("Failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("{program} exited with {code}: {stderr}")]
    Failed {
        program: String,
        code: String,
        stderr: String,
    },
}

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Expand a command template into argv.
///
/// Every `{key}` occurrence inside an argument is replaced by the matching
/// value; a placeholder with no value is an error.
pub fn render_command(template: &str, values: &[(&str, String)]) -> Result<Vec<String>, ToolError> {
    let mut argv = Vec::new();

    for token in template.split_whitespace() {
        for name in placeholders(token) {
            if !values.iter().any(|(key, _)| *key == name) {
                return Err(ToolError::UnknownPlaceholder(name.to_string()));
            }
        }
        let mut arg = token.to_string();
        for (key, value) in values {
            arg = arg.replace(&format!("{{{}}}", key), value);
        }
        argv.push(arg);
    }

    if argv.is_empty() {
        return Err(ToolError::EmptyCommand);
    }
    Ok(argv)
}

/// `{name}` tokens in one template argument
fn placeholders(token: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    names.push(name);
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Runs a rendered command line
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> Result<ToolOutput, ToolError>;
}

/// Runs commands as child processes with a hard timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }
}

#[async_trait]
impl ToolRunner for CommandRunner {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> Result<ToolOutput, ToolError> {
        let (program, args) = argv.split_first().ok_or(ToolError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        debug!(program = %program, args = ?args, "Running external tool");

        let child = command.spawn().map_err(|e| ToolError::Launch {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolError::Launch {
                program: program.clone(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    program: program.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ToolError::Failed {
                program: program.clone(),
                code,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

//! The `bash` tool.
//!
//! Runs one command through `sh -c` and answers with plain text: stdout on
//! success, stderr (or stdout) on failure.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Result, TurnloopError};
use crate::tool::{Tool, ToolContext};

/// Configuration for the shell tool
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// Working directory for commands; the process cwd when unset
    pub base_dir: Option<PathBuf>,
    /// Keep only the last lines of very long output
    pub max_output_lines: usize,
    pub timeout_secs: u64,
    /// Substrings that refuse a command outright
    pub blocked_commands: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_output_lines: 500,
            timeout_secs: 120,
            blocked_commands: vec![
                "rm -rf /".into(),
                "rm -rf /*".into(),
                "mkfs".into(),
                "dd if=".into(),
                ":(){:|:&};:".into(), // fork bomb
            ],
        }
    }
}

pub struct BashTool {
    config: ShellConfig,
}

impl BashTool {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    fn tail(&self, text: &str) -> String {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() > self.config.max_output_lines {
            lines[lines.len() - self.config.max_output_lines..].join("\n")
        } else {
            text.to_string()
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run bash command"
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The command to run"}
            },
            "required": ["command"]
        }))
    }

    async fn call(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| TurnloopError::InvalidArguments {
                name: self.name().into(),
                reason: "missing `command`".into(),
            })?;

        if let Some(blocked) = self
            .config
            .blocked_commands
            .iter()
            .find(|blocked| command.contains(blocked.as_str()))
        {
            tracing::warn!(command, blocked = %blocked, "refused blocked shell command");
            return Ok(Value::String(format!(
                "Error: command blocked for safety: contains '{blocked}'"
            )));
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(base_dir) = &self.config.base_dir {
            cmd.current_dir(base_dir);
        }

        tracing::debug!(command, depth = ctx.depth(), "running shell command");
        let output = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), cmd.output())
            .await
            .map_err(|_| TurnloopError::ToolInvocation {
                name: self.name().into(),
                source: format!("command timed out after {}s", self.config.timeout_secs).into(),
            })?
            .map_err(|err| TurnloopError::ToolInvocation {
                name: self.name().into(),
                source: Box::new(err),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() {
            return Ok(Value::String(self.tail(&stdout)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = if !stderr.trim().is_empty() {
            self.tail(&stderr)
        } else if !stdout.trim().is_empty() {
            self.tail(&stdout)
        } else {
            match output.status.code() {
                Some(code) => format!("Command exited with status {code}"),
                None => "Command terminated by signal".to_string(),
            }
        };
        Ok(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash() -> BashTool {
        BashTool::new(ShellConfig::default())
    }

    #[tokio::test]
    async fn returns_stdout_text() {
        let result = bash()
            .call(json!({"command": "echo hello"}), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(result, Value::String("hello\n".into()));
    }

    #[tokio::test]
    async fn failing_commands_return_stderr() {
        let result = bash()
            .call(json!({"command": "echo oops >&2; exit 3"}), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(result, Value::String("oops\n".into()));

        let silent = bash()
            .call(json!({"command": "exit 4"}), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(silent, Value::String("Command exited with status 4".into()));
    }

    #[tokio::test]
    async fn blocked_commands_are_refused() {
        let result = bash()
            .call(json!({"command": "rm -rf /"}), &ToolContext::new())
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("blocked"));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let tool = BashTool::new(ShellConfig {
            timeout_secs: 1,
            ..ShellConfig::default()
        });
        let err = tool
            .call(json!({"command": "sleep 5"}), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let tool = BashTool::new(ShellConfig {
            max_output_lines: 2,
            ..ShellConfig::default()
        });
        assert_eq!(tool.tail("a\nb\nc"), "b\nc");
    }
}

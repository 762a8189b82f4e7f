use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::process::Command;

use crate::config::ToolsConfig;
use crate::error::{Result, TurnloopError};
use crate::tool::{Tool, ToolContext, ToolRegistry};
use crate::tools::session::{ListSessionsTool, ResumeSessionTool, SummarizeSessionTool};
use crate::tools::shell::BashTool;
use crate::tools::web::WebSearchTool;

const MAX_SEARCH_LINES: usize = 200;
const SKIPPED_DIRS: [&str; 3] = ["node_modules", "target", ".git"];

/// File tools only: `read_file`, `list_files` and `edit_file`.
pub fn file_toolkit() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(ListFilesTool);
    registry.register(EditFileTool);
    registry
}

/// Everything a coding agent gets by default: shell, files, search and session tools.
pub fn coding_toolkit(config: &ToolsConfig) -> ToolRegistry {
    let mut registry = file_toolkit();
    registry.register(SearchTool);
    registry.register(BashTool::new(config.shell()));
    registry.register(WebSearchTool::new(config.web()));
    registry.register(ListSessionsTool);
    registry.register(ResumeSessionTool);
    registry.register(SummarizeSessionTool);
    registry
}

fn string_arg<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

fn required_arg<'a>(input: &'a Value, key: &str, tool: &str) -> Result<&'a str> {
    string_arg(input, key).ok_or_else(|| TurnloopError::InvalidArguments {
        name: tool.into(),
        reason: format!("missing `{key}`"),
    })
}

fn invocation_error(tool: &str, err: std::io::Error) -> TurnloopError {
    TurnloopError::ToolInvocation {
        name: tool.into(),
        source: Box::new(err),
    }
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path. Use this to examine existing code before making changes."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The relative path to the file to read"}
            },
            "required": ["path"]
        }))
    }

    async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let path = required_arg(&input, "path", self.name())?;
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Value::String(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Ok(Value::String(format!("Error: File not found: {path}")))
            }
            Err(err) => Err(invocation_error(self.name(), err)),
        }
    }
}

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories at the given path. Directories have a trailing slash."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory path to list. Defaults to current directory if empty."
                }
            }
        }))
    }

    async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let path = string_arg(&input, "path")
            .filter(|path| !path.is_empty())
            .unwrap_or(".");

        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(Value::String(format!("Error: Directory not found: {path}")));
            }
            Err(err) => return Err(invocation_error(self.name(), err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| invocation_error(self.name(), err))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        if names.is_empty() {
            return Ok(Value::String("(empty directory)".into()));
        }
        Ok(Value::String(names.join("\n")))
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_str with new_str. If old_str is empty and file doesn't exist, creates a new file with new_str as content."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "The file path to edit or create"},
                "old_str": {"type": "string", "description": "The text to replace. Empty string to create new file."},
                "new_str": {"type": "string", "description": "The replacement text or content for new file."}
            },
            "required": ["path", "new_str"]
        }))
    }

    async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let path = required_arg(&input, "path", self.name())?;
        let new_str = required_arg(&input, "new_str", self.name())?;
        let old_str = string_arg(&input, "old_str").unwrap_or_default();

        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound && old_str.is_empty() => {
                if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|err| invocation_error(self.name(), err))?;
                }
                fs::write(path, new_str)
                    .await
                    .map_err(|err| invocation_error(self.name(), err))?;
                return Ok(Value::String("OK (created new file)".into()));
            }
            Err(err) => return Err(invocation_error(self.name(), err)),
        };

        let updated = if old_str.is_empty() {
            new_str.to_string()
        } else if content.contains(old_str) {
            content.replacen(old_str, new_str, 1)
        } else {
            return Ok(Value::String("Error: old_str not found in file".into()));
        };

        fs::write(path, updated)
            .await
            .map_err(|err| invocation_error(self.name(), err))?;
        Ok(Value::String("OK".into()))
    }
}

/// Recursive `grep -rn` over a directory.
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search for a text pattern in files under a directory. Returns matching lines as path:line:text."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The pattern to search for"},
                "path": {"type": "string", "description": "Directory to search in. Defaults to the current directory."},
                "include_node_modules": {"type": "boolean", "description": "Also search node_modules, target and .git"}
            },
            "required": ["query"]
        }))
    }

    async fn call(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let query = required_arg(&input, "query", self.name())?;
        let path = string_arg(&input, "path")
            .filter(|path| !path.is_empty())
            .unwrap_or(".");
        let everything = input
            .get("include_node_modules")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut command = Command::new("grep");
        command.arg("-rn");
        if !everything {
            for dir in SKIPPED_DIRS {
                command.arg(format!("--exclude-dir={dir}"));
            }
        }
        command.arg("-e").arg(query).arg("--").arg(path);

        let output = command
            .output()
            .await
            .map_err(|err| invocation_error(self.name(), err))?;
        match output.status.code() {
            Some(0) => {}
            Some(1) => return Ok(Value::String("No matches found.".into())),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Ok(Value::String(format!(
                    "Error searching files: {}",
                    stderr.trim()
                )));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().collect();
        if lines.len() <= MAX_SEARCH_LINES {
            return Ok(Value::String(lines.join("\n")));
        }
        Ok(Value::String(format!(
            "{}\n... ({} more matches)",
            lines[..MAX_SEARCH_LINES].join("\n"),
            lines.len() - MAX_SEARCH_LINES
        )))
    }
}

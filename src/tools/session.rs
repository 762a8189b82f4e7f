//! Tools over the session log directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::message::Message;
use crate::session::{self, DEFAULT_LOG_DIR};
use crate::tool::{Tool, ToolContext};

fn log_dir(ctx: &ToolContext) -> PathBuf {
    ctx.log_dir()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn not_found(needle: &str) -> Value {
    Value::String(format!(
        "Session not found matching \"{needle}\". Use list_sessions to see available sessions."
    ))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn session_id(input: &Value) -> &str {
    input
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

pub struct ListSessionsTool;

#[async_trait]
impl Tool for ListSessionsTool {
    fn name(&self) -> &str {
        "list_sessions"
    }

    fn description(&self) -> &str {
        "List available past sessions with their timestamps and topics."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({"type": "object", "properties": {}}))
    }

    async fn call(&self, _input: Value, ctx: &ToolContext) -> Result<Value> {
        let sessions = match session::list_sessions(&log_dir(ctx)).await {
            Ok(sessions) => sessions,
            Err(err) => return Ok(Value::String(format!("Error listing sessions: {err}"))),
        };
        if sessions.is_empty() {
            return Ok(Value::String("No sessions found.".into()));
        }

        let lines: Vec<String> = sessions
            .into_iter()
            .map(|entry| match (entry.timestamp, entry.topic) {
                (Some(timestamp), Some(topic)) => format!("- {timestamp}: {topic}"),
                _ => format!("- {}", entry.file_name),
            })
            .collect();
        Ok(Value::String(format!("Available sessions:\n{}", lines.join("\n"))))
    }
}

pub struct ResumeSessionTool;

#[async_trait]
impl Tool for ResumeSessionTool {
    fn name(&self) -> &str {
        "resume_session"
    }

    fn description(&self) -> &str {
        "Switch context to a previous session and continue working from there."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The session ID or filename (or part of it) to resume. Use list_sessions to find IDs."
                }
            },
            "required": ["session_id"]
        }))
    }

    async fn call(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let needle = session_id(&input);
        let Some(loader) = ctx.session_loader() else {
            return Ok(Value::String(
                "Error: resuming sessions is not available in this context".into(),
            ));
        };

        let dir = log_dir(ctx);
        let path = match session::find_session(&dir, needle).await {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(not_found(needle)),
            Err(err) => return Ok(Value::String(format!("Error resuming session: {err}"))),
        };

        let messages = session::load_session_file(&path).await?;
        if messages.is_empty() {
            return Ok(Value::String("Session file is empty or invalid.".into()));
        }
        loader.load_session(messages).await?;

        Ok(Value::String(format!(
            "Session resumed: {}. The context has been loaded.",
            file_name(&path)
        )))
    }
}

fn report_prompt(history: &str) -> String {
    format!(
        "Please analyze the following conversation session and generate a structured report.\n\n\
         The report should include:\n\
         1. **Goals**: What was the user trying to achieve?\n\
         2. **Completed Items**: What tasks were finished?\n\
         3. **Active Work**: What was being worked on when the session ended?\n\
         4. **File Changes**: Which files were modified (if apparent)?\n\
         5. **Lessons Learned**: Any key insights or technical details discovered?\n\n\
         Conversation History:\n{history}\n"
    )
}

/// Asks the context's client for a report on a logged session.
pub struct SummarizeSessionTool;

#[async_trait]
impl Tool for SummarizeSessionTool {
    fn name(&self) -> &str {
        "summarize_session"
    }

    fn description(&self) -> &str {
        "Generate a report on a past session including goals, completed items, active work, file changes, and lessons learned."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The session ID or filename (or part of it) to summarize. Use list_sessions to find IDs."
                }
            },
            "required": ["session_id"]
        }))
    }

    async fn call(&self, input: Value, ctx: &ToolContext) -> Result<Value> {
        let needle = session_id(&input);
        let Some(client) = ctx.client() else {
            return Ok(Value::String(
                "Error: summarizing sessions needs a completion client".into(),
            ));
        };

        let path = match session::find_session(&log_dir(ctx), needle).await {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(not_found(needle)),
            Err(err) => return Ok(Value::String(format!("Error summarizing session: {err}"))),
        };
        let messages = session::load_session_file(&path).await?;
        if messages.is_empty() {
            return Ok(Value::String("Session file is empty or invalid.".into()));
        }

        let history = serde_json::to_string(&messages)?;
        let request = [Message::user(report_prompt(&history))];
        let (report, usage) = match client.complete(&request, &[]).await {
            Ok(response) => response.into_message()?,
            Err(err) => return Ok(Value::String(format!("Error summarizing session: {err}"))),
        };
        tracing::debug!(
            session = %path.display(),
            total_tokens = usage.total_tokens(),
            "session summarized"
        );

        Ok(Value::String(format!(
            "Session Report for {}:\n\n{}",
            file_name(&path),
            report.text()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ScriptedClient};
    use crate::memory::ConversationMemory;
    use crate::message::Role;
    use std::sync::Arc;

    async fn write_session(dir: &Path, name: &str, messages: &[Message]) {
        let body: String = messages
            .iter()
            .map(|m| serde_json::to_string(m).unwrap() + "\n")
            .collect();
        tokio::fs::write(dir.join(name), body).await.unwrap();
    }

    #[tokio::test]
    async fn lists_sessions_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("2025-03-01-08-30-fix-login.jsonl"), "")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("2025-03-02-09-00-add-cache.jsonl"), "")
            .await
            .unwrap();
        let ctx = ToolContext::new().with_log_dir(dir.path());

        let out = ListSessionsTool.call(json!({}), &ctx).await.unwrap();

        assert_eq!(
            out,
            Value::String(
                "Available sessions:\n- 2025-03-02-09-00: add-cache\n- 2025-03-01-08-30: fix-login".into()
            )
        );
    }

    #[tokio::test]
    async fn empty_directory_has_no_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new().with_log_dir(dir.path());
        let out = ListSessionsTool.call(json!({}), &ctx).await.unwrap();
        assert_eq!(out, Value::String("No sessions found.".into()));
    }

    #[tokio::test]
    async fn resume_loads_messages_through_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let stored = vec![Message::user("old question"), Message::assistant("old answer")];
        write_session(dir.path(), "2025-03-01-08-30-old-question.jsonl", &stored).await;

        let memory = ConversationMemory::with_messages(vec![Message::user("current")]);
        let ctx = ToolContext::new()
            .with_log_dir(dir.path())
            .with_session_loader(Arc::new(memory.clone()));

        let out = ResumeSessionTool
            .call(json!({"session_id": "old-question"}), &ctx)
            .await
            .unwrap();

        assert_eq!(
            out,
            Value::String(
                "Session resumed: 2025-03-01-08-30-old-question.jsonl. The context has been loaded.".into()
            )
        );
        assert_eq!(memory.snapshot().await, stored);
    }

    #[tokio::test]
    async fn resume_reports_unknown_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new()
            .with_log_dir(dir.path())
            .with_session_loader(Arc::new(ConversationMemory::default()));

        let out = ResumeSessionTool
            .call(json!({"session_id": "nothing"}), &ctx)
            .await
            .unwrap();

        assert!(out.as_str().unwrap().starts_with("Session not found matching \"nothing\""));
    }

    #[tokio::test]
    async fn summarize_asks_the_client_for_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let stored = vec![Message::user("rename the crate"), Message::assistant("renamed it")];
        write_session(dir.path(), "2025-04-10-14-05-rename-the-crate.jsonl", &stored).await;
        let client = ScriptedClient::new(vec![CompletionResponse::text("Goals: rename")]);
        let ctx = ToolContext::new()
            .with_log_dir(dir.path())
            .with_client(client.clone());

        let out = SummarizeSessionTool
            .call(json!({"session_id": "rename"}), &ctx)
            .await
            .unwrap();

        assert_eq!(
            out,
            Value::String(
                "Session Report for 2025-04-10-14-05-rename-the-crate.jsonl:\n\nGoals: rename".into()
            )
        );
        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 1);
        assert_eq!(requests[0][0].role, Role::User);
        let prompt = requests[0][0].text();
        assert!(prompt.contains("**Lessons Learned**"));
        assert!(prompt.contains(&serde_json::to_string(&stored).unwrap()));
    }

    #[tokio::test]
    async fn summarize_without_a_client_is_reported_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new().with_log_dir(dir.path());

        let out = SummarizeSessionTool
            .call(json!({"session_id": "anything"}), &ctx)
            .await
            .unwrap();

        assert_eq!(
            out,
            Value::String("Error: summarizing sessions needs a completion client".into())
        );
    }

    #[tokio::test]
    async fn summarize_reports_unknown_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new(vec![]);
        let ctx = ToolContext::new()
            .with_log_dir(dir.path())
            .with_client(client.clone());

        let out = SummarizeSessionTool
            .call(json!({"session_id": "missing"}), &ctx)
            .await
            .unwrap();

        assert!(out.as_str().unwrap().starts_with("Session not found matching \"missing\""));
        assert!(client.requests().is_empty());
    }
}

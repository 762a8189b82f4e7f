//! Conversation logs on disk.
//!
//! Each conversation is appended, one JSON message per line, to
//! `<log_dir>/YYYY-MM-DD-HH-MM-<topic>.jsonl`. The topic comes from the
//! first user message.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::hooks::TurnHook;
use crate::message::{Message, Role};

pub const DEFAULT_LOG_DIR: &str = ".session_logs";
const UNKNOWN_TOPIC: &str = "unknown-topic";
const TOPIC_WORDS: usize = 5;

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("valid slug pattern"))
}

fn dash_runs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-{2,}").expect("valid dash pattern"))
}

fn log_file_name() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2})-(.*)\.jsonl$").expect("valid log name pattern")
    })
}

/// Replaces the live conversation with a stored one.
#[async_trait]
pub trait SessionLoader: Send + Sync {
    async fn load_session(&self, messages: Vec<Message>) -> Result<()>;
}

#[derive(Default)]
struct LogState {
    file: Option<PathBuf>,
    logged: usize,
    root: Option<Message>,
}

/// Incremental JSONL writer for one conversation at a time.
pub struct SessionLog {
    dir: PathBuf,
    state: Mutex<LogState>,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File currently being appended to, if anything was logged yet.
    pub async fn current_file(&self) -> Option<PathBuf> {
        self.state.lock().await.file.clone()
    }

    /// Append the part of `messages` not yet written.
    ///
    /// A different first message or a shorter history than already logged
    /// means a different conversation, which goes to a new file.
    pub async fn log(&self, messages: &[Message]) -> Result<()> {
        let Some(first) = messages.first() else {
            return Ok(());
        };
        let mut state = self.state.lock().await;

        let root_changed = state.root.as_ref().is_some_and(|root| root != first);
        if root_changed || messages.len() < state.logged {
            tracing::debug!(dir = %self.dir.display(), "conversation changed, starting a new session log");
            *state = LogState::default();
        }
        state.root = Some(first.clone());
        if messages.len() == state.logged {
            return Ok(());
        }

        let path = if let Some(path) = state.file.clone() {
            path
        } else {
            tokio::fs::create_dir_all(&self.dir).await?;
            let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M");
            let path = self.dir.join(format!("{timestamp}-{}.jsonl", topic_slug(messages)));
            state.file = Some(path.clone());
            path
        };

        let mut content = String::new();
        for message in &messages[state.logged..] {
            content.push_str(&serde_json::to_string(message)?);
            content.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        state.logged = messages.len();
        Ok(())
    }
}

#[async_trait]
impl TurnHook for SessionLog {
    async fn on_message(&self, history: &[Message]) -> Result<()> {
        self.log(history).await
    }
}

/// Filename-safe topic from the first words of the first user message.
pub fn topic_slug(messages: &[Message]) -> String {
    let Some(text) = messages
        .iter()
        .find(|message| message.role == Role::User)
        .map(Message::text)
    else {
        return UNKNOWN_TOPIC.to_string();
    };

    let joined = text
        .split_whitespace()
        .take(TOPIC_WORDS)
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    let cleaned = unsafe_chars().replace_all(&joined, "");
    let collapsed = dash_runs().replace_all(&cleaned, "-");
    let slug = collapsed.trim_matches('-');
    if slug.is_empty() {
        UNKNOWN_TOPIC.to_string()
    } else {
        slug.to_string()
    }
}

/// A log file found in the session directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub file_name: String,
    pub timestamp: Option<String>,
    pub topic: Option<String>,
}

impl SessionEntry {
    fn from_file_name(file_name: String) -> Self {
        let parsed = log_file_name()
            .captures(&file_name)
            .map(|caps| (caps[1].to_string(), caps[2].to_string()));
        let (timestamp, topic) = match parsed {
            Some((timestamp, topic)) => (Some(timestamp), Some(topic)),
            None => (None, None),
        };
        Self {
            file_name,
            timestamp,
            topic,
        }
    }
}

/// Every `.jsonl` log in `dir`, newest first. A missing directory has no sessions.
pub async fn list_sessions(dir: &Path) -> Result<Vec<SessionEntry>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".jsonl") {
            names.push(name);
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names.into_iter().map(SessionEntry::from_file_name).collect())
}

/// Newest log whose file name contains `needle`.
pub async fn find_session(dir: &Path, needle: &str) -> Result<Option<PathBuf>> {
    Ok(list_sessions(dir)
        .await?
        .into_iter()
        .find(|entry| entry.file_name.contains(needle))
        .map(|entry| dir.join(entry.file_name)))
}

/// Read a log back into messages. Lines that do not parse are skipped.
pub async fn load_session_file(path: &Path) -> Result<Vec<Message>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut messages = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(message) => messages.push(message),
            Err(err) => {
                tracing::warn!(path = %path.display(), line = index + 1, error = %err, "skipping unreadable session line");
            }
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_come_from_the_first_user_message() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("  Fix the flaky *login* test, then deploy to prod"),
        ];
        assert_eq!(topic_slug(&messages), "fix-the-flaky-login-test");
    }

    #[test]
    fn slug_falls_back_when_nothing_survives() {
        assert_eq!(topic_slug(&[Message::user("¿¡!!")]), UNKNOWN_TOPIC);
        assert_eq!(topic_slug(&[Message::system("only system")]), UNKNOWN_TOPIC);
        assert_eq!(topic_slug(&[Message::user("- -- ok --")]), "ok");
    }

    #[test]
    fn parses_session_file_names() {
        let entry = SessionEntry::from_file_name("2025-01-31-09-05-fix-login.jsonl".into());
        assert_eq!(entry.timestamp.as_deref(), Some("2025-01-31-09-05"));
        assert_eq!(entry.topic.as_deref(), Some("fix-login"));

        let odd = SessionEntry::from_file_name("notes.jsonl".into());
        assert!(odd.timestamp.is_none());
    }

    #[tokio::test]
    async fn appends_only_new_messages() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        let mut history = vec![Message::user("hello there")];

        log.log(&history).await.unwrap();
        history.push(Message::assistant("hi"));
        log.log(&history).await.unwrap();
        log.log(&history).await.unwrap();

        let file = log.current_file().await.unwrap();
        assert!(file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-hello-there.jsonl"));
        assert_eq!(load_session_file(&file).await.unwrap(), history);
    }

    #[tokio::test]
    async fn new_root_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path());

        log.log(&[Message::user("first topic")]).await.unwrap();
        let first = log.current_file().await.unwrap();
        log.log(&[Message::user("second topic")]).await.unwrap();
        let second = log.current_file().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(load_session_file(&second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shrinking_history_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new(dir.path());
        let long = vec![
            Message::user("same root"),
            Message::assistant("a"),
            Message::user("b"),
        ];

        log.log(&long).await.unwrap();
        log.log(&long[..1]).await.unwrap();

        // Within one minute the fresh file shares the old name, so count across files.
        let mut logged = 0;
        for entry in list_sessions(dir.path()).await.unwrap() {
            logged += load_session_file(&dir.path().join(entry.file_name))
                .await
                .unwrap()
                .len();
        }
        assert_eq!(logged, 4);
    }

    #[tokio::test]
    async fn loading_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2025-01-01-00-00-x.jsonl");
        tokio::fs::write(
            &path,
            "{\"role\":\"user\",\"content\":\"hi\"}\nnot json\n\n{\"role\":\"assistant\",\"content\":\"yo\"}\n",
        )
        .await
        .unwrap();

        let messages = load_session_file(&path).await.unwrap();
        assert_eq!(messages, vec![Message::user("hi"), Message::assistant("yo")]);
    }

    #[tokio::test]
    async fn lists_newest_first_and_finds_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2025-01-01-10-00-older.jsonl",
            "2025-02-01-10-00-newer.jsonl",
            "readme.txt",
        ] {
            tokio::fs::write(dir.path().join(name), "").await.unwrap();
        }

        let sessions = list_sessions(dir.path()).await.unwrap();
        let names: Vec<&str> = sessions.iter().map(|s| s.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["2025-02-01-10-00-newer.jsonl", "2025-01-01-10-00-older.jsonl"]
        );

        let found = find_session(dir.path(), "older").await.unwrap().unwrap();
        assert!(found.ends_with("2025-01-01-10-00-older.jsonl"));
        assert!(find_session(dir.path(), "missing").await.unwrap().is_none());
        assert!(list_sessions(&dir.path().join("nope")).await.unwrap().is_empty());
    }
}

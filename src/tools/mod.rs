//! Built-in tools that need more than the file helpers in `toolkit`:
//! - Shell: the `bash` command tool
//! - Session: listing, resuming and summarizing logged conversations
//! - Web: `web_search` over the Tavily API

pub mod session;
pub mod shell;
pub mod web;

pub use session::{ListSessionsTool, ResumeSessionTool, SummarizeSessionTool};
pub use shell::{BashTool, ShellConfig};
pub use web::{WebSearchConfig, WebSearchTool, TAVILY_BASE_URL};

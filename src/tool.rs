use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::ToolExecutor;
use crate::error::Result;
use crate::llm::CompletionClient;
use crate::session::SessionLoader;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Optionally return a JSON Schema-like object describing the expected arguments.
    fn parameters(&self) -> Option<Value> {
        None
    }

    async fn call(&self, input: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Static description of a tool that is sent to the completion service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Option<Value>,
}

/// Read-only bundle handed to every tool invocation.
///
/// Cloning is cheap; every handle is shared.
#[derive(Clone, Default)]
pub struct ToolContext {
    client: Option<Arc<dyn CompletionClient>>,
    executor: Option<Arc<dyn ToolExecutor>>,
    log_dir: Option<PathBuf>,
    session_loader: Option<Arc<dyn SessionLoader>>,
    depth: usize,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_session_loader(mut self, loader: Arc<dyn SessionLoader>) -> Self {
        self.session_loader = Some(loader);
        self
    }

    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn client(&self) -> Option<&Arc<dyn CompletionClient>> {
        self.client.as_ref()
    }

    pub fn executor(&self) -> Option<&Arc<dyn ToolExecutor>> {
        self.executor.as_ref()
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn session_loader(&self) -> Option<&Arc<dyn SessionLoader>> {
        self.session_loader.as_ref()
    }

    /// Number of delegation hops between this call and the top-level turn.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn describe(&self) -> Vec<ToolDescription> {
        let mut descriptions: Vec<ToolDescription> = self.tools.values().map(describe).collect();
        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        descriptions
    }

    /// Descriptions for the named tools only, in the order given. Unknown names are skipped.
    pub fn describe_only<S: AsRef<str>>(&self, names: &[S]) -> Vec<ToolDescription> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name.as_ref()))
            .map(describe)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn describe(tool: &Arc<dyn Tool>) -> ToolDescription {
    ToolDescription {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use voiceloop_core::text::system_notification;

use crate::traits::{EventSink, Outbound};

/// How a tool's result reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolMode {
    /// Run to completion, then answer with a function response.
    Immediate,
    /// Run detached; the result arrives later as a notification turn.
    /// `ack`, when set, is returned right away as the function response.
    Background { ack: Option<String> },
}

/// Progress reported by a tool while it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolUpdate {
    Status(String),
    Thought(String),
    Log(String),
    Data(serde_json::Value),
}

/// Advertised to the backend when a session is set up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// What a tool may do besides returning its result.
#[derive(Clone)]
pub struct ToolContext {
    tool: String,
    outbound: mpsc::Sender<Outbound>,
    sink: Arc<dyn EventSink>,
}

impl ToolContext {
    pub fn new(
        tool: impl Into<String>,
        outbound: mpsc::Sender<Outbound>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            tool: tool.into(),
            outbound,
            sink,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Sends a "System Notification" turn to the backend.
    pub async fn notify(&self, message: &str, end_of_turn: bool) -> anyhow::Result<()> {
        self.outbound
            .send(Outbound::text(system_notification(message), end_of_turn))
            .await
            .map_err(|_| anyhow::anyhow!("session closed before notification could be sent"))
    }

    pub fn progress(&self, update: ToolUpdate) {
        self.sink.on_tool_update(&self.tool, &update);
    }

    pub fn project_changed(&self, project: &str) {
        self.sink.on_project_update(project);
    }

    pub fn report_error(&self, message: &str) {
        self.sink.on_error(message);
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "OBJECT", "properties": {} })
    }

    fn mode(&self) -> ToolMode {
        ToolMode::Immediate
    }

    async fn invoke(&self, args: &serde_json::Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        if self.tools.insert(name.clone(), handler).is_some() {
            log::warn!("tool '{name}' registered twice; keeping the later handler");
        }
    }

    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools
            .values()
            .map(|t| ToolDeclaration {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }
}

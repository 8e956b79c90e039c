use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolMode, ToolUpdate};

use super::{object_schema, required_str};

pub const WEB_AGENT_ACK: &str = "Web Navigation started. Do not reply to this message.";

/// Drives a browser through a natural-language task.
#[async_trait]
pub trait WebAgent: Send + Sync {
    /// `on_log` receives one line per step the agent takes.
    async fn run_task(
        &self,
        prompt: &str,
        on_log: &(dyn Fn(&str) + Send + Sync),
    ) -> anyhow::Result<String>;
}

pub struct SimulatedWebAgent {
    step_delay: Duration,
}

impl SimulatedWebAgent {
    pub fn new() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Default for SimulatedWebAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebAgent for SimulatedWebAgent {
    async fn run_task(
        &self,
        prompt: &str,
        on_log: &(dyn Fn(&str) + Send + Sync),
    ) -> anyhow::Result<String> {
        log::info!("simulated web task: {prompt}");
        on_log("Navigating to page (Simulated)...");
        tokio::time::sleep(self.step_delay).await;
        on_log("Found information (Simulated).");
        Ok(format!("Simulated web search result for: {prompt}"))
    }
}

pub struct RunWebAgent {
    agent: Arc<dyn WebAgent>,
}

impl RunWebAgent {
    pub fn new(agent: Arc<dyn WebAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ToolHandler for RunWebAgent {
    fn name(&self) -> &str {
        "run_web_agent"
    }

    fn description(&self) -> &str {
        "Opens a web browser and performs a task according to the prompt."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[(
                "prompt",
                "STRING",
                "The detailed instructions for the web browser agent.",
            )],
            &["prompt"],
        )
    }

    fn mode(&self) -> ToolMode {
        ToolMode::Background {
            ack: Some(WEB_AGENT_ACK.into()),
        }
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let prompt = required_str(args, "prompt")?;
        let log_line = |line: &str| ctx.progress(ToolUpdate::Log(line.to_string()));
        let result = self.agent.run_task(prompt, &log_line).await?;
        Ok(format!("Web Agent has finished.\nResult: {result}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::Harness;

    #[tokio::test(start_paused = true)]
    async fn web_task_streams_log_lines() {
        let h = Harness::new();
        let tool = RunWebAgent::new(Arc::new(SimulatedWebAgent::new()));
        let out = tool
            .invoke(
                &serde_json::json!({"prompt": "weather in Oslo"}),
                &h.ctx("run_web_agent"),
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            "Web Agent has finished.\nResult: Simulated web search result for: weather in Oslo"
        );

        let updates = h.sink.updates.lock().unwrap();
        assert_eq!(
            *updates,
            vec![
                (
                    "run_web_agent".to_string(),
                    ToolUpdate::Log("Navigating to page (Simulated)...".into())
                ),
                (
                    "run_web_agent".to_string(),
                    ToolUpdate::Log("Found information (Simulated).".into())
                ),
            ]
        );
    }
}

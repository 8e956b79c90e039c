use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolMode, ToolUpdate};

use super::{leave_scratch_project, object_schema, required_str};
use crate::projects::ProjectManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadResult {
    pub file_path: PathBuf,
}

/// Turns a text prompt into a printable model written under `output_dir`.
///
/// `Ok(None)` means the agent gave up without a model.
#[async_trait]
pub trait CadAgent: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        output_dir: &Path,
        progress: &(dyn Fn(ToolUpdate) + Send + Sync),
    ) -> anyhow::Result<Option<CadResult>>;

    /// Reworks the latest model. Defaults to a fresh generation.
    async fn iterate(
        &self,
        prompt: &str,
        output_dir: &Path,
        progress: &(dyn Fn(ToolUpdate) + Send + Sync),
    ) -> anyhow::Result<Option<CadResult>> {
        self.generate(prompt, output_dir, progress).await
    }
}

const SIMULATED_STL: &str = "solid mock\nendsolid mock\n";

/// Writes a placeholder STL after a few scripted thoughts.
pub struct SimulatedCad {
    step_delay: Duration,
}

impl SimulatedCad {
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

impl Default for SimulatedCad {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CadAgent for SimulatedCad {
    async fn generate(
        &self,
        prompt: &str,
        output_dir: &Path,
        progress: &(dyn Fn(ToolUpdate) + Send + Sync),
    ) -> anyhow::Result<Option<CadResult>> {
        log::info!("simulated CAD generation for '{prompt}'");
        progress(ToolUpdate::Data(json!({
            "status": "generating",
            "attempt": 1,
            "max_attempts": 1,
        })));
        progress(ToolUpdate::Thought("Analyzing requirements... (Mock)".into()));
        tokio::time::sleep(self.step_delay).await;
        progress(ToolUpdate::Thought("Generating geometry... (Mock)".into()));
        tokio::time::sleep(self.step_delay).await;
        progress(ToolUpdate::Thought("Finalizing design... (Mock)".into()));

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create dir: {}", output_dir.display()))?;
        let file_path = output_dir.join("mock_output.stl");
        tokio::fs::write(&file_path, SIMULATED_STL)
            .await
            .with_context(|| format!("failed to write {}", file_path.display()))?;
        Ok(Some(CadResult { file_path }))
    }
}

fn prompt_schema(description: &str) -> Value {
    object_schema(&[("prompt", "STRING", description)], &["prompt"])
}

fn artifact_update(project: &str, path: &Path) -> ToolUpdate {
    ToolUpdate::Data(json!({
        "project": project,
        "file": path.to_string_lossy(),
    }))
}

pub struct GenerateCad {
    agent: Arc<dyn CadAgent>,
    projects: Arc<ProjectManager>,
}

impl GenerateCad {
    pub fn new(agent: Arc<dyn CadAgent>, projects: Arc<ProjectManager>) -> Self {
        Self { agent, projects }
    }
}

#[async_trait]
impl ToolHandler for GenerateCad {
    fn name(&self) -> &str {
        "generate_cad"
    }

    fn description(&self) -> &str {
        "Generates a 3D CAD model based on a prompt."
    }

    fn parameters(&self) -> Value {
        prompt_schema("The description of the object to generate.")
    }

    // The model already acknowledged the request when the user asked.
    fn mode(&self) -> ToolMode {
        ToolMode::Background { ack: None }
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let prompt = required_str(args, "prompt")?;
        ctx.progress(ToolUpdate::Status("generating".into()));
        leave_scratch_project(&self.projects, ctx).await?;

        let report = |u: ToolUpdate| ctx.progress(u);
        let result = self
            .agent
            .generate(prompt, &self.projects.cad_dir(), &report)
            .await?;
        let Some(result) = result else {
            ctx.progress(ToolUpdate::Status("failed".into()));
            return Ok("CAD generation failed.".into());
        };

        let saved = self.projects.save_cad_artifact(&result.file_path, prompt)?;
        ctx.progress(artifact_update(&self.projects.current_name(), &saved));
        ctx.progress(ToolUpdate::Status("complete".into()));
        Ok("CAD generation is complete! The 3D model is now displayed for the user. \
            Let them know it's ready."
            .into())
    }
}

pub struct IterateCad {
    agent: Arc<dyn CadAgent>,
    projects: Arc<ProjectManager>,
}

impl IterateCad {
    pub fn new(agent: Arc<dyn CadAgent>, projects: Arc<ProjectManager>) -> Self {
        Self { agent, projects }
    }
}

#[async_trait]
impl ToolHandler for IterateCad {
    fn name(&self) -> &str {
        "iterate_cad"
    }

    fn description(&self) -> &str {
        "Modifies or iterates on the current CAD design based on user feedback. Use this when the \
         user asks to adjust, change, modify, or iterate on the existing 3D model (e.g., 'make it \
         taller', 'add a handle', 'reduce the thickness')."
    }

    fn parameters(&self) -> Value {
        prompt_schema("The changes or modifications to apply to the current design.")
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let prompt = required_str(args, "prompt")?;
        ctx.progress(ToolUpdate::Status("generating".into()));

        let report = |u: ToolUpdate| ctx.progress(u);
        let result = self
            .agent
            .iterate(prompt, &self.projects.cad_dir(), &report)
            .await?;
        let Some(result) = result else {
            ctx.progress(ToolUpdate::Status("failed".into()));
            return Ok(format!("Failed to iterate design with prompt: {prompt}"));
        };

        let saved = self
            .projects
            .save_cad_artifact(&result.file_path, &format!("Iteration: {prompt}"))?;
        ctx.progress(artifact_update(&self.projects.current_name(), &saved));
        ctx.progress(ToolUpdate::Status("complete".into()));
        Ok(format!(
            "Successfully iterated design: {prompt}. The updated 3D model is now displayed."
        ))
    }
}

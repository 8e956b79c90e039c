use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use voiceloop_engine::tools::{ToolContext, ToolHandler};

use super::{object_schema, required_str};
use crate::projects::{ProjectError, ProjectManager};

pub struct CreateProject {
    projects: Arc<ProjectManager>,
}

impl CreateProject {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for CreateProject {
    fn name(&self) -> &str {
        "create_project"
    }

    fn description(&self) -> &str {
        "Creates a new project folder to organize files."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[("name", "STRING", "The name of the new project.")],
            &["name"],
        )
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw = required_str(args, "name")?;
        let name = match self.projects.create_project(raw) {
            Ok(name) => name,
            Err(e @ (ProjectError::AlreadyExists(_) | ProjectError::InvalidName(_))) => {
                return Ok(e.to_string());
            }
            Err(e) => return Err(e.into()),
        };
        // New projects become current straight away.
        self.projects.switch_project(&name)?;
        ctx.project_changed(&name);
        Ok(format!("Project '{name}' created. Switched to '{name}'."))
    }
}

pub struct SwitchProject {
    projects: Arc<ProjectManager>,
}

impl SwitchProject {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for SwitchProject {
    fn name(&self) -> &str {
        "switch_project"
    }

    fn description(&self) -> &str {
        "Switches the current active project context."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[("name", "STRING", "The name of the project to switch to.")],
            &["name"],
        )
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let raw = required_str(args, "name")?;
        let name = match self.projects.switch_project(raw) {
            Ok(name) => name,
            Err(e @ (ProjectError::NotFound(_) | ProjectError::InvalidName(_))) => {
                return Ok(e.to_string());
            }
            Err(e) => return Err(e.into()),
        };
        ctx.project_changed(&name);

        let msg = format!("Switched to project '{name}'.");
        // Silent context load: the backend should not answer this turn.
        match self.projects.project_context() {
            Ok(context) => {
                if let Err(e) = ctx.notify(&format!("{msg}\n\n{context}"), false).await {
                    log::warn!("failed to send project context: {e}");
                }
            }
            Err(e) => log::warn!("failed to gather context for '{name}': {e:#}"),
        }
        Ok(msg)
    }
}

pub struct ListProjects {
    projects: Arc<ProjectManager>,
}

impl ListProjects {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ListProjects {
    fn name(&self) -> &str {
        "list_projects"
    }

    fn description(&self) -> &str {
        "Lists all available projects."
    }

    async fn invoke(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let projects = self.projects.list_projects()?;
        Ok(format!("Available projects: {}", projects.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::Harness;
    use serde_json::json;
    use voiceloop_engine::traits::{Outbound, Payload};

    #[tokio::test]
    async fn create_switches_to_the_new_project() {
        let h = Harness::new();
        let tool = CreateProject::new(Arc::clone(&h.projects));

        let out = tool
            .invoke(&json!({"name": "Desk Lamp"}), &h.ctx("create_project"))
            .await
            .unwrap();
        assert_eq!(out, "Project 'Desk Lamp' created. Switched to 'Desk Lamp'.");
        assert_eq!(h.projects.current_name(), "Desk Lamp");
        assert_eq!(*h.sink.projects.lock().unwrap(), vec!["Desk Lamp".to_string()]);

        let again = tool
            .invoke(&json!({"name": "Desk Lamp"}), &h.ctx("create_project"))
            .await
            .unwrap();
        assert_eq!(again, "Project 'Desk Lamp' already exists.");
        assert!(tool.invoke(&json!({}), &h.ctx("create_project")).await.is_err());
    }

    #[tokio::test]
    async fn switch_sends_context_without_ending_the_turn() {
        let mut h = Harness::new();
        h.projects.create_project("lamp").unwrap();
        std::fs::write(h.projects.root().join("lamp").join("notes.md"), "x").unwrap();

        let tool = SwitchProject::new(Arc::clone(&h.projects));
        let out = tool
            .invoke(&json!({"name": "lamp"}), &h.ctx("switch_project"))
            .await
            .unwrap();
        assert_eq!(out, "Switched to project 'lamp'.");
        assert_eq!(*h.sink.projects.lock().unwrap(), vec!["lamp".to_string()]);

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        let Outbound::Send {
            payload: Payload::Text(text),
            end_of_turn,
        } = &sent[0]
        else {
            panic!("expected a text notification, got {sent:?}");
        };
        assert!(!end_of_turn);
        assert!(text.starts_with("System Notification: Switched to project 'lamp'.\n\n"));
        assert!(text.contains("- notes.md"));
    }

    #[tokio::test]
    async fn switch_to_missing_project_reports_without_notifying() {
        let mut h = Harness::new();
        let tool = SwitchProject::new(Arc::clone(&h.projects));
        let out = tool
            .invoke(&json!({"name": "ghost"}), &h.ctx("switch_project"))
            .await
            .unwrap();
        assert_eq!(out, "Project 'ghost' does not exist.");
        assert!(h.drain().is_empty());
        assert!(h.sink.projects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lists_projects() {
        let h = Harness::new();
        h.projects.create_project("lamp").unwrap();
        let out = ListProjects::new(Arc::clone(&h.projects))
            .invoke(&json!({}), &h.ctx("list_projects"))
            .await
            .unwrap();
        assert_eq!(out, "Available projects: lamp, temp");
    }
}

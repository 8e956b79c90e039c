//! The assistant's tool catalogue.
//!
//! Each tool is a `ToolHandler` over one collaborator. Project and file tools
//! work on the real filesystem through `ProjectManager`; the CAD, printer,
//! smart-home and web collaborators sit behind traits and ship as simulations.

pub mod cad;
pub mod files;
pub mod printer;
pub mod project;
pub mod smart_home;
pub mod web;

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value, json};
use voiceloop_engine::tools::{ToolContext, ToolRegistry};

use crate::projects::ProjectManager;

pub use cad::{CadAgent, CadResult, SimulatedCad};
pub use printer::{PrintJobStatus, PrinterAgent, PrinterInfo, SimulatedPrinters};
pub use smart_home::{SimulatedSmartHome, SmartDevice, SmartHome};
pub use web::{SimulatedWebAgent, WebAgent};

/// Collaborators the tools act on.
#[derive(Clone)]
pub struct ToolSuite {
    pub projects: Arc<ProjectManager>,
    pub smart_home: Arc<dyn SmartHome>,
    pub printers: Arc<dyn PrinterAgent>,
    pub cad: Arc<dyn CadAgent>,
    pub web: Arc<dyn WebAgent>,
}

impl ToolSuite {
    /// Real projects and files; everything else simulated.
    pub fn simulated(projects: Arc<ProjectManager>) -> Self {
        Self {
            projects,
            smart_home: Arc::new(SimulatedSmartHome::new()),
            printers: Arc::new(SimulatedPrinters::new()),
            cad: Arc::new(SimulatedCad::new()),
            web: Arc::new(SimulatedWebAgent::new()),
        }
    }

    pub fn registry(&self) -> ToolRegistry {
        let p = &self.projects;
        ToolRegistry::new()
            .with(Arc::new(project::CreateProject::new(Arc::clone(p))))
            .with(Arc::new(project::SwitchProject::new(Arc::clone(p))))
            .with(Arc::new(project::ListProjects::new(Arc::clone(p))))
            .with(Arc::new(files::WriteFile::new(Arc::clone(p))))
            .with(Arc::new(files::ReadFile::new(Arc::clone(p))))
            .with(Arc::new(files::ReadDirectory::new(Arc::clone(p))))
            .with(Arc::new(smart_home::ListSmartDevices::new(Arc::clone(&self.smart_home))))
            .with(Arc::new(smart_home::ControlLight::new(Arc::clone(&self.smart_home))))
            .with(Arc::new(printer::DiscoverPrinters::new(Arc::clone(&self.printers))))
            .with(Arc::new(printer::PrintStl::new(
                Arc::clone(&self.printers),
                Arc::clone(p),
            )))
            .with(Arc::new(printer::GetPrintStatus::new(Arc::clone(&self.printers))))
            .with(Arc::new(cad::GenerateCad::new(Arc::clone(&self.cad), Arc::clone(p))))
            .with(Arc::new(cad::IterateCad::new(Arc::clone(&self.cad), Arc::clone(p))))
            .with(Arc::new(web::RunWebAgent::new(Arc::clone(&self.web))))
    }
}

/// Builds an argument schema in the backend's type vocabulary.
///
/// `props` is `(name, TYPE, description)`.
pub(crate) fn object_schema(props: &[(&str, &str, &str)], required: &[&str]) -> Value {
    let mut properties = Map::new();
    for (name, ty, description) in props {
        properties.insert(
            (*name).to_string(),
            json!({ "type": ty, "description": description }),
        );
    }
    json!({
        "type": "OBJECT",
        "properties": properties,
        "required": required,
    })
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string argument '{key}'"))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Moves work out of the scratch project before anything is saved.
pub(crate) async fn leave_scratch_project(
    projects: &ProjectManager,
    ctx: &ToolContext,
) -> anyhow::Result<()> {
    let Some(name) = projects.ensure_named_project()? else {
        return Ok(());
    };
    log::info!("'{}' auto-created project '{name}'", ctx.tool());
    ctx.project_changed(&name);
    let notice = format!("Automatic Project Creation. Switched to new project '{name}'.");
    if let Err(e) = ctx.notify(&notice, false).await {
        log::warn!("failed to announce auto-created project: {e}");
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolMode};

use super::{leave_scratch_project, object_schema, required_str};
use crate::projects::ProjectManager;

// Larger files are cut before they reach the backend.
const MAX_READ_BYTES: usize = 64 * 1024;

pub struct WriteFile {
    projects: Arc<ProjectManager>,
}

impl WriteFile {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes content to a file in the current project. Relative paths keep their sub-folders."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[
                ("path", "STRING", "Path of the file, relative to the current project."),
                ("content", "STRING", "The full text content to write."),
            ],
            &["path", "content"],
        )
    }

    fn mode(&self) -> ToolMode {
        ToolMode::Background {
            ack: Some("Writing file...".into()),
        }
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(args, "path")?;
        let content = required_str(args, "content")?;
        leave_scratch_project(&self.projects, ctx).await?;

        let target = match self.projects.resolve_in_project(path) {
            Ok(t) => t,
            Err(e) => return Ok(format!("Failed to write file '{path}': {e}")),
        };
        log::info!("writing {}", target.display());
        if let Err(e) = write_text(&target, content).await {
            return Ok(format!("Failed to write file '{path}': {e}"));
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Ok(format!(
            "File '{file_name}' written successfully to project '{}'.",
            self.projects.current_name()
        ))
    }
}

async fn write_text(target: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, content).await
}

/// Relative paths are taken from the current project; absolute paths as given.
fn resolve_for_read(projects: &ProjectManager, raw: &str) -> PathBuf {
    let p = Path::new(raw.trim());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        projects.current_path().join(p)
    }
}

pub struct ReadFile {
    projects: Arc<ProjectManager>,
}

impl ReadFile {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads the content of a text file."
    }

    fn parameters(&self) -> Value {
        object_schema(&[("path", "STRING", "Path of the file to read.")], &["path"])
    }

    fn mode(&self) -> ToolMode {
        ToolMode::Background {
            ack: Some("Reading file...".into()),
        }
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(args, "path")?;
        let target = resolve_for_read(&self.projects, path);
        if !target.is_file() {
            return Ok(format!("File '{path}' does not exist."));
        }
        let bytes = match tokio::fs::read(&target).await {
            Ok(b) => b,
            Err(e) => return Ok(format!("Failed to read file '{path}': {e}")),
        };

        let truncated = bytes.len() > MAX_READ_BYTES;
        let shown = &bytes[..bytes.len().min(MAX_READ_BYTES)];
        let mut out = format!("Content of '{path}':\n{}", String::from_utf8_lossy(shown));
        if truncated {
            out.push_str(&format!("\n[truncated: file is {} bytes]", bytes.len()));
        }
        Ok(out)
    }
}

pub struct ReadDirectory {
    projects: Arc<ProjectManager>,
}

impl ReadDirectory {
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self { projects }
    }
}

#[async_trait]
impl ToolHandler for ReadDirectory {
    fn name(&self) -> &str {
        "read_directory"
    }

    fn description(&self) -> &str {
        "Lists the contents of a directory."
    }

    fn parameters(&self) -> Value {
        object_schema(&[("path", "STRING", "Path of the directory to list.")], &["path"])
    }

    fn mode(&self) -> ToolMode {
        ToolMode::Background {
            ack: Some("Reading directory...".into()),
        }
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let path = required_str(args, "path")?;
        let target = resolve_for_read(&self.projects, path);
        if !target.is_dir() {
            return Ok(format!("Directory '{path}' does not exist."));
        }

        let mut names = Vec::new();
        let listed = async {
            let mut entries = tokio::fs::read_dir(&target).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            Ok::<_, std::io::Error>(())
        };
        if let Err(e) = listed.await {
            return Ok(format!("Failed to read directory '{path}': {e}"));
        }
        names.sort();
        Ok(format!("Contents of '{path}': {}", names.join(", ")))
    }
}

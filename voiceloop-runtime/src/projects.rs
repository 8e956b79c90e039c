use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voiceloop_core::text::{ProjectNameError, sanitize_project_name};
use voiceloop_core::types::ChatEntry;
use voiceloop_engine::traits::ChatLog;

use crate::chat_log::{CHAT_HISTORY_FILE, ChatHistoryStore};

/// Where work lands before the user names a project.
pub const SCRATCH_PROJECT: &str = "temp";

const CAD_DIR: &str = "cad";
const CAD_ARTIFACTS_FILE: &str = "artifacts.json";
const CONTEXT_MAX_FILES: usize = 50;
const CONTEXT_HISTORY: usize = 10;
const HISTORY_MAX_ENTRIES: usize = 500;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    InvalidName(#[from] ProjectNameError),

    #[error("Project '{0}' already exists.")]
    AlreadyExists(String),

    #[error("Project '{0}' does not exist.")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadArtifact {
    pub file: String,
    pub prompt: String,
    pub ts: i64,
}

/// Project folders under one root, with a single "current" project.
///
/// Each project keeps its own chat history, so the manager doubles as the
/// engine's chat log: entries go to whichever project is current.
///
/// Background tools share one manager. `writes` serialises every
/// read-modify-write on project state (scratch exit, CAD index, chat log).
pub struct ProjectManager {
    root: PathBuf,
    current: Mutex<String>,
    writes: Mutex<()>,
}

impl ProjectManager {
    /// Opens (and creates if needed) `root`, starting in the scratch project.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let scratch = root.join(SCRATCH_PROJECT);
        fs::create_dir_all(&scratch)
            .with_context(|| format!("failed to create project dir: {}", scratch.display()))?;
        Ok(Self {
            root,
            current: Mutex::new(SCRATCH_PROJECT.to_string()),
            writes: Mutex::new(()),
        })
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_name(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_scratch(&self) -> bool {
        self.current_name() == SCRATCH_PROJECT
    }

    pub fn current_path(&self) -> PathBuf {
        self.root.join(self.current_name())
    }

    fn history(&self) -> ChatHistoryStore {
        ChatHistoryStore::in_dir(&self.current_path()).with_max_entries(HISTORY_MAX_ENTRIES)
    }

    /// Creates `<root>/<name>` and returns the sanitized name. Does not switch.
    pub fn create_project(&self, raw: &str) -> Result<String, ProjectError> {
        let name = sanitize_project_name(raw)?;
        let dir = self.root.join(&name);
        if dir.exists() {
            return Err(ProjectError::AlreadyExists(name));
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create project dir: {}", dir.display()))?;
        log::info!("created project '{name}'");
        Ok(name)
    }

    pub fn switch_project(&self, raw: &str) -> Result<String, ProjectError> {
        let name = sanitize_project_name(raw)?;
        if !self.root.join(&name).is_dir() {
            return Err(ProjectError::NotFound(name));
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = name.clone();
        log::info!("switched to project '{name}'");
        Ok(name)
    }

    /// Project folder names, sorted.
    pub fn list_projects(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list projects: {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Leaves the scratch project for a fresh `Project_<timestamp>`.
    ///
    /// Returns the new project's name, or `None` when already in a named project.
    pub fn ensure_named_project(&self) -> Result<Option<String>, ProjectError> {
        let _guard = self.write_guard();
        if !self.is_scratch() {
            return Ok(None);
        }
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("Project_{stamp}");
        let mut name = base.clone();
        let mut n = 1;
        loop {
            match self.create_project(&name) {
                Ok(created) => {
                    name = created;
                    break;
                }
                Err(ProjectError::AlreadyExists(_)) => {
                    n += 1;
                    name = format!("{base}_{n}");
                }
                Err(e) => return Err(e),
            }
        }
        self.switch_project(&name)?;
        Ok(Some(name))
    }

    /// Resolves a tool-supplied path inside the current project.
    ///
    /// Relative paths keep their sub-directories; absolute paths keep only
    /// the file name. Parent-directory components are rejected.
    pub fn resolve_in_project(&self, raw: &str) -> anyhow::Result<PathBuf> {
        let requested = Path::new(raw.trim());
        let relative: PathBuf = if requested.is_absolute() {
            requested
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow::anyhow!("path '{raw}' has no file name"))?
        } else {
            requested.to_path_buf()
        };
        if relative.as_os_str().is_empty() {
            anyhow::bail!("path is empty");
        }
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("path '{raw}' leaves the project folder");
        }
        Ok(self.current_path().join(relative))
    }

    pub fn cad_dir(&self) -> PathBuf {
        self.current_path().join(CAD_DIR)
    }

    /// Files of the current project (relative paths), chat history excluded.
    pub fn project_files(&self) -> anyhow::Result<Vec<String>> {
        let base = self.current_path();
        let mut out = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to read dir: {}", dir.display())));
                }
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&base) else {
                    continue;
                };
                if rel == Path::new(CHAT_HISTORY_FILE) {
                    continue;
                }
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        out.sort();
        Ok(out)
    }

    /// A summary of the current project for the backend: files and recent chat.
    pub fn project_context(&self) -> anyhow::Result<String> {
        let name = self.current_name();
        let files = self.project_files()?;
        let history = self.history().recent(CONTEXT_HISTORY)?;

        let mut out = format!("Project '{name}' context.\n");
        if files.is_empty() {
            out.push_str("Files: none yet.\n");
        } else {
            out.push_str("Files:\n");
            for f in files.iter().take(CONTEXT_MAX_FILES) {
                out.push_str(&format!("- {f}\n"));
            }
            if files.len() > CONTEXT_MAX_FILES {
                out.push_str(&format!("- ... and {} more\n", files.len() - CONTEXT_MAX_FILES));
            }
        }
        if !history.is_empty() {
            out.push_str("\nRecent conversation:\n");
            for e in &history {
                out.push_str(&format!("[{}]: {}\n", e.sender, e.text));
            }
        }
        Ok(out)
    }

    /// Records a CAD result in `<project>/cad`, copying the file in if it
    /// lives elsewhere. Returns the artifact's path inside the project.
    pub fn save_cad_artifact(&self, source: &Path, prompt: &str) -> anyhow::Result<PathBuf> {
        let _guard = self.write_guard();
        let cad_dir = self.cad_dir();
        fs::create_dir_all(&cad_dir)
            .with_context(|| format!("failed to create dir: {}", cad_dir.display()))?;

        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("CAD artifact has no file name: {}", source.display()))?;
        let dest = cad_dir.join(file_name);
        if source.exists() && source != dest.as_path() {
            fs::copy(source, &dest).with_context(|| {
                format!("failed to copy {} -> {}", source.display(), dest.display())
            })?;
        }

        let index = cad_dir.join(CAD_ARTIFACTS_FILE);
        let mut artifacts: Vec<CadArtifact> = if index.exists() {
            let raw = fs::read_to_string(&index)
                .with_context(|| format!("failed to read {}", index.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", index.display()))?
        } else {
            Vec::new()
        };
        artifacts.push(CadArtifact {
            file: file_name.to_string_lossy().into_owned(),
            prompt: prompt.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
        });
        crate::fsutil::write_atomic(&index, &serde_json::to_vec_pretty(&artifacts)?)?;
        Ok(dest)
    }

    pub fn cad_artifacts(&self) -> anyhow::Result<Vec<CadArtifact>> {
        let index = self.cad_dir().join(CAD_ARTIFACTS_FILE);
        if !index.exists() {
            return Ok(vec![]);
        }
        let raw = fs::read_to_string(&index)
            .with_context(|| format!("failed to read {}", index.display()))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl ChatLog for ProjectManager {
    fn log_chat(&self, sender: &str, text: &str) -> anyhow::Result<()> {
        let _guard = self.write_guard();
        self.history().append(sender, text)
    }

    fn recent_chat_history(&self, limit: usize) -> anyhow::Result<Vec<ChatEntry>> {
        self.history().recent(limit)
    }

    fn current_project(&self) -> Option<String> {
        Some(self.current_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, ProjectManager) {
        let dir = tempfile::tempdir().unwrap();
        let pm = ProjectManager::open(dir.path().join("projects")).unwrap();
        (dir, pm)
    }

    #[test]
    fn starts_in_scratch_project() {
        let (_dir, pm) = manager();
        assert!(pm.is_scratch());
        assert!(pm.current_path().is_dir());
        assert_eq!(pm.list_projects().unwrap(), vec!["temp"]);
        assert_eq!(pm.current_project().as_deref(), Some("temp"));
    }

    #[test]
    fn create_and_switch() {
        let (_dir, pm) = manager();
        assert_eq!(pm.create_project(" Desk Lamp ").unwrap(), "Desk Lamp");
        assert!(matches!(
            pm.create_project("Desk Lamp"),
            Err(ProjectError::AlreadyExists(_))
        ));
        // Creating does not switch.
        assert!(pm.is_scratch());

        assert_eq!(pm.switch_project("Desk Lamp").unwrap(), "Desk Lamp");
        assert_eq!(pm.current_name(), "Desk Lamp");
        assert!(matches!(pm.switch_project("nope"), Err(ProjectError::NotFound(_))));
        assert!(matches!(pm.switch_project("  "), Err(ProjectError::InvalidName(_))));
        assert_eq!(pm.list_projects().unwrap(), vec!["Desk Lamp", "temp"]);
    }

    #[test]
    fn chat_history_follows_current_project() {
        let (_dir, pm) = manager();
        pm.log_chat("User", "in scratch").unwrap();
        pm.create_project("lamp").unwrap();
        pm.switch_project("lamp").unwrap();
        pm.log_chat("User", "in lamp").unwrap();

        let lamp = pm.recent_chat_history(10).unwrap();
        assert_eq!(lamp, vec![ChatEntry::new("User", "in lamp")]);
        pm.switch_project("temp").unwrap();
        assert_eq!(pm.recent_chat_history(10).unwrap()[0].text, "in scratch");
    }

    #[test]
    fn ensure_named_project_leaves_scratch_once() {
        let (_dir, pm) = manager();
        let name = pm.ensure_named_project().unwrap().unwrap();
        assert!(name.starts_with("Project_"));
        assert_eq!(pm.current_name(), name);
        assert_eq!(pm.ensure_named_project().unwrap(), None);

        // A second scratch escape within the same second gets a suffix.
        pm.switch_project("temp").unwrap();
        let second = pm.ensure_named_project().unwrap().unwrap();
        assert_ne!(second, name);
    }

    #[test]
    fn resolves_paths_inside_project() {
        let (_dir, pm) = manager();
        let base = pm.current_path();
        assert_eq!(pm.resolve_in_project("src/main.rs").unwrap(), base.join("src/main.rs"));
        assert_eq!(pm.resolve_in_project("/etc/notes.txt").unwrap(), base.join("notes.txt"));
        assert!(pm.resolve_in_project("../escape.txt").is_err());
        assert!(pm.resolve_in_project("  ").is_err());
    }

    #[test]
    fn context_lists_files_and_recent_chat() {
        let (_dir, pm) = manager();
        pm.create_project("lamp").unwrap();
        pm.switch_project("lamp").unwrap();
        fs::create_dir_all(pm.current_path().join("cad")).unwrap();
        fs::write(pm.current_path().join("cad/base.stl"), "solid").unwrap();
        fs::write(pm.current_path().join("notes.md"), "# notes").unwrap();
        pm.log_chat("User", "make the base wider").unwrap();

        let ctx = pm.project_context().unwrap();
        assert!(ctx.starts_with("Project 'lamp' context."));
        assert!(ctx.contains("- cad/base.stl\n- notes.md"));
        assert!(!ctx.contains(CHAT_HISTORY_FILE));
        assert!(ctx.contains("[User]: make the base wider"));
    }

    #[test]
    fn saves_cad_artifacts_into_project() {
        let (dir, pm) = manager();
        let outside = dir.path().join("model.stl");
        fs::write(&outside, "solid cube").unwrap();

        let saved = pm.save_cad_artifact(&outside, "a cube").unwrap();
        assert_eq!(saved, pm.cad_dir().join("model.stl"));
        assert_eq!(fs::read_to_string(&saved).unwrap(), "solid cube");

        pm.save_cad_artifact(&saved, "Iteration: taller").unwrap();
        let artifacts = pm.cad_artifacts().unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].prompt, "Iteration: taller");
    }

    #[test]
    fn concurrent_cad_saves_keep_every_index_entry() {
        let (dir, pm) = manager();
        pm.create_project("lamp").unwrap();
        pm.switch_project("lamp").unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let (pm, dir) = (&pm, dir.path());
                s.spawn(move || {
                    for i in 0..20 {
                        let src = dir.join(format!("part_{t}_{i}.stl"));
                        fs::write(&src, "solid").unwrap();
                        pm.save_cad_artifact(&src, &format!("part {t}/{i}")).unwrap();
                    }
                });
            }
        });

        let artifacts = pm.cad_artifacts().unwrap();
        assert_eq!(artifacts.len(), 160);
        assert!(artifacts.iter().any(|a| a.file == "part_7_19.stl"));
    }

    #[test]
    fn concurrent_scratch_exits_create_one_project() {
        let (_dir, pm) = manager();

        let created: Vec<Option<String>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| pm.ensure_named_project().unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let names: Vec<_> = created.into_iter().flatten().collect();
        assert_eq!(names.len(), 1);
        assert_eq!(pm.current_name(), names[0]);
        assert_eq!(pm.list_projects().unwrap().len(), 2);
    }
}

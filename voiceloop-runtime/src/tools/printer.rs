use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolUpdate};

use super::{object_schema, optional_str, required_str};
use crate::projects::ProjectManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub printer_type: String,
    pub camera_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Temperature {
    pub current: f64,
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrintJobStatus {
    pub printer: String,
    pub state: String,
    pub progress_percent: f64,
    pub time_remaining: Option<String>,
    pub time_elapsed: Option<String>,
    pub filename: Option<String>,
    pub hotend: Option<Temperature>,
    pub bed: Option<Temperature>,
}

impl PrintJobStatus {
    fn describe(&self) -> String {
        let mut out = format!(
            "Printer: {}\nState: {}\nProgress: {:.1}%\n",
            self.printer, self.state, self.progress_percent
        );
        if let Some(t) = &self.time_remaining {
            out.push_str(&format!("Time Remaining: {t}\n"));
        }
        if let Some(t) = &self.time_elapsed {
            out.push_str(&format!("Time Elapsed: {t}\n"));
        }
        if let Some(f) = &self.filename {
            out.push_str(&format!("File: {f}\n"));
        }
        if let Some(t) = self.hotend {
            out.push_str(&format!("Hotend: {:.0}°C / {:.0}°C\n", t.current, t.target));
        }
        if let Some(t) = self.bed {
            out.push_str(&format!("Bed: {:.0}°C / {:.0}°C", t.current, t.target));
        }
        out.trim_end().to_string()
    }
}

#[async_trait]
pub trait PrinterAgent: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<PrinterInfo>>;

    /// Slices and uploads `stl`, then starts the job. Returns a summary line.
    ///
    /// `progress` receives a percentage and a short label per stage.
    async fn print_stl(
        &self,
        stl: &Path,
        printer: &str,
        profile: Option<&str>,
        progress: &(dyn Fn(u8, &str) + Send + Sync),
    ) -> anyhow::Result<String>;

    /// `None` when the printer is unknown.
    async fn status(&self, printer: &str) -> anyhow::Result<Option<PrintJobStatus>>;

    fn profiles(&self) -> Vec<String> {
        Vec::new()
    }
}

/// One virtual printer that accepts every job.
pub struct SimulatedPrinters {
    step_delay: Duration,
}

impl SimulatedPrinters {
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

impl Default for SimulatedPrinters {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrinterAgent for SimulatedPrinters {
    async fn discover(&self) -> anyhow::Result<Vec<PrinterInfo>> {
        Ok(vec![PrinterInfo {
            name: "Demo Printer (Virtual)".into(),
            host: "192.168.1.100".into(),
            port: 80,
            printer_type: "moonraker".into(),
            camera_url: None,
        }])
    }

    async fn print_stl(
        &self,
        stl: &Path,
        printer: &str,
        _profile: Option<&str>,
        progress: &(dyn Fn(u8, &str) + Send + Sync),
    ) -> anyhow::Result<String> {
        log::info!("simulated print of {} on '{printer}'", stl.display());
        progress(10, "Slicing (Mock)...");
        tokio::time::sleep(self.step_delay).await;
        progress(50, "Uploading (Mock)...");
        tokio::time::sleep(self.step_delay).await;
        progress(100, "Starting Print (Mock)...");
        Ok("Print started on virtual printer.".into())
    }

    async fn status(&self, _printer: &str) -> anyhow::Result<Option<PrintJobStatus>> {
        Ok(Some(PrintJobStatus {
            printer: "Demo Printer".into(),
            state: "printing".into(),
            progress_percent: 45.5,
            time_remaining: Some("12m 30s".into()),
            time_elapsed: Some("10m 00s".into()),
            filename: Some("demo_cube.stl".into()),
            hotend: Some(Temperature {
                current: 210.0,
                target: 210.0,
            }),
            bed: Some(Temperature {
                current: 60.0,
                target: 60.0,
            }),
        }))
    }

    fn profiles(&self) -> Vec<String> {
        vec!["Generic PLA".into(), "Generic PETG".into()]
    }
}

pub struct DiscoverPrinters {
    agent: Arc<dyn PrinterAgent>,
}

impl DiscoverPrinters {
    pub fn new(agent: Arc<dyn PrinterAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ToolHandler for DiscoverPrinters {
    fn name(&self) -> &str {
        "discover_printers"
    }

    fn description(&self) -> &str {
        "Discovers 3D printers available on the local network."
    }

    async fn invoke(&self, _args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let printers = self.agent.discover().await?;
        if printers.is_empty() {
            return Ok(
                "No printers found on network. Ensure printers are on and running OctoPrint/Moonraker."
                    .into(),
            );
        }
        if let Ok(v) = serde_json::to_value(&printers) {
            ctx.progress(ToolUpdate::Data(v));
        }
        let lines: Vec<String> = printers
            .iter()
            .map(|p| format!("{} ({}:{}, type: {})", p.name, p.host, p.port, p.printer_type))
            .collect();
        Ok(format!("Found Printers:\n{}", lines.join("\n")))
    }
}

pub struct PrintStl {
    agent: Arc<dyn PrinterAgent>,
    projects: Arc<ProjectManager>,
}

impl PrintStl {
    pub fn new(agent: Arc<dyn PrinterAgent>, projects: Arc<ProjectManager>) -> Self {
        Self { agent, projects }
    }

    /// `current` means the newest CAD artifact of the current project.
    fn resolve_stl(&self, raw: &str) -> anyhow::Result<PathBuf> {
        if raw.trim().eq_ignore_ascii_case("current") {
            let latest = self.projects.cad_artifacts()?.pop();
            return Ok(match latest {
                Some(a) => self.projects.cad_dir().join(a.file),
                None => self.projects.cad_dir().join("output.stl"),
            });
        }
        let p = Path::new(raw.trim());
        Ok(if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.projects.current_path().join(p)
        })
    }
}

#[async_trait]
impl ToolHandler for PrintStl {
    fn name(&self) -> &str {
        "print_stl"
    }

    fn description(&self) -> &str {
        "Prints an STL file to a 3D printer. Handles slicing the STL to G-code and uploading to the printer."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[
                (
                    "stl_path",
                    "STRING",
                    "Path to STL file, or 'current' for the most recent CAD model.",
                ),
                ("printer", "STRING", "Printer name or IP address."),
                ("profile", "STRING", "Optional slicer profile name."),
            ],
            &["stl_path", "printer"],
        )
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let stl = self.resolve_stl(required_str(args, "stl_path")?)?;
        let printer = required_str(args, "printer")?;
        let profile = optional_str(args, "profile");

        let report = |percent: u8, label: &str| {
            ctx.progress(ToolUpdate::Data(json!({
                "printer": printer,
                "progress": percent,
                "message": label,
            })));
        };
        self.agent.print_stl(&stl, printer, profile, &report).await
    }
}

pub struct GetPrintStatus {
    agent: Arc<dyn PrinterAgent>,
}

impl GetPrintStatus {
    pub fn new(agent: Arc<dyn PrinterAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ToolHandler for GetPrintStatus {
    fn name(&self) -> &str {
        "get_print_status"
    }

    fn description(&self) -> &str {
        "Gets the current status of a 3D printer including progress, time remaining, and temperatures."
    }

    fn parameters(&self) -> Value {
        object_schema(
            &[("printer", "STRING", "Printer name or IP address.")],
            &["printer"],
        )
    }

    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        let printer = required_str(args, "printer")?;
        Ok(match self.agent.status(printer).await? {
            Some(status) => status.describe(),
            None => format!(
                "Could not get status for printer '{printer}'. Ensure it is discovered first."
            ),
        })
    }
}

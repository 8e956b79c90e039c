mod console;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use voiceloop_core::config::{AppConfig, VideoMode};
use voiceloop_engine::engine::{EngineDeps, VoiceloopEngine};
use voiceloop_engine::traits::{AudioDevices, FrameSource, NoAudio};
use voiceloop_providers::live::{GeminiLiveBackend, LiveConfig};
use voiceloop_providers::protocol::SetupParams;
use voiceloop_runtime::capture::SnapshotFile;
use voiceloop_runtime::config_store::ConfigStore;
use voiceloop_runtime::projects::ProjectManager;
use voiceloop_runtime::tools::ToolSuite;

const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "VOICELOOP_API_KEY"];

#[derive(Debug, Parser)]
#[command(name = "voiceloop", version, about = "Talk to a live voice model with tools.")]
struct Args {
    /// JSON config; missing fields (or a missing file) fall back to defaults.
    #[arg(long, default_value = "voiceloop.json")]
    config: PathBuf,

    #[arg(long, env = "VOICELOOP_LOG", default_value = "info")]
    log_level: log::LevelFilter,

    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Run without microphone and speaker (typed input only).
    #[arg(long)]
    no_audio: bool,

    /// Camera snapshot JPEG, re-read whenever it changes. Overrides `camera_snapshot`.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Print the audio input and output device names and exit.
    #[arg(long)]
    list_devices: bool,

    /// Overrides the configured first-connection message.
    #[arg(long)]
    start_message: Option<String>,

    /// Where project folders live. Defaults to the config value, then ./projects.
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    /// Write the effective config back to `--config` and exit.
    #[arg(long)]
    write_config: bool,
}

fn api_key() -> anyhow::Result<String> {
    API_KEY_VARS
        .iter()
        .find_map(|var| {
            std::env::var(var)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .with_context(|| format!("set {} (or put it in .env)", API_KEY_VARS.join(" or ")))
}

#[cfg(feature = "audio")]
fn audio_devices(cfg: &AppConfig) -> Arc<dyn AudioDevices> {
    Arc::new(voiceloop_audio::CpalDevices {
        input_name: cfg.input_device.clone(),
        output_name: cfg.output_device.clone(),
        send_rate_hz: cfg.vad.send_sample_rate_hz,
        receive_rate_hz: cfg.vad.receive_sample_rate_hz,
    })
}

#[cfg(not(feature = "audio"))]
fn audio_devices(_cfg: &AppConfig) -> Arc<dyn AudioDevices> {
    log::warn!("built without the `audio` feature; running text-only");
    Arc::new(NoAudio)
}

#[cfg(feature = "audio")]
fn print_devices() -> anyhow::Result<()> {
    for (label, input) in [("Input", true), ("Output", false)] {
        println!("{label} devices:");
        for name in voiceloop_audio::device::list_device_names(input)? {
            println!("  {name}");
        }
    }
    Ok(())
}

#[cfg(not(feature = "audio"))]
fn print_devices() -> anyhow::Result<()> {
    anyhow::bail!("built without the `audio` feature; no devices to list")
}

fn frame_source(cfg: &AppConfig) -> Option<Arc<dyn FrameSource>> {
    match cfg.video_mode {
        VideoMode::None => None,
        VideoMode::Camera => match &cfg.camera_snapshot {
            Some(path) => {
                log::info!("camera frames from {path}");
                Some(Arc::new(SnapshotFile::new(path)))
            }
            None => {
                log::info!("no camera snapshot configured; camera frames are off");
                None
            }
        },
        VideoMode::Screen => screen_source(),
    }
}

#[cfg(feature = "screen")]
fn screen_source() -> Option<Arc<dyn FrameSource>> {
    Some(Arc::new(voiceloop_runtime::capture::ScreenCapture::new()))
}

#[cfg(not(feature = "screen"))]
fn screen_source() -> Option<Arc<dyn FrameSource>> {
    log::warn!("built without the `screen` feature; screen frames are off");
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    logging::init(args.log_level, args.log_file.as_deref())?;
    if args.list_devices {
        return print_devices();
    }

    let store = ConfigStore::at_path(&args.config);
    let mut cfg = store.load_or_default()?;
    if let Some(msg) = args.start_message {
        cfg.start_message = Some(msg);
    }
    if let Some(image) = &args.image {
        cfg.camera_snapshot = Some(image.to_string_lossy().into_owned());
    }
    if let Some(dir) = &args.projects_dir {
        cfg.projects_dir = Some(dir.to_string_lossy().into_owned());
    }
    if args.write_config {
        store.save(&cfg)?;
        println!("wrote {}", store.path().display());
        return Ok(());
    }

    let projects_root = cfg
        .projects_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("projects"));
    let projects = Arc::new(ProjectManager::open(&projects_root)?);
    log::info!("projects under {}", projects.root().display());

    let tools = ToolSuite::simulated(Arc::clone(&projects)).registry();
    let setup = SetupParams {
        model: cfg.model.clone(),
        voice_name: cfg.voice_name.clone(),
        system_instruction: cfg.system_instruction.clone(),
        tools: tools.declarations(),
    };
    let backend = GeminiLiveBackend::new(LiveConfig::production(api_key()?, setup)?);

    let devices: Arc<dyn AudioDevices> = if args.no_audio {
        Arc::new(NoAudio)
    } else {
        audio_devices(&cfg)
    };

    let engine = Arc::new(VoiceloopEngine::new(
        &cfg,
        EngineDeps {
            backend: Arc::new(backend),
            devices,
            chat_log: projects,
            tools,
            sink: Arc::new(console::ConsoleSink),
        },
    ));

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.stop();
            }
        });
    }
    tokio::spawn(console::command_loop(Arc::clone(&engine)));

    println!("{}", console::HELP);
    match frame_source(&cfg) {
        Some(source) => {
            let interval = Duration::from_millis(cfg.frame_interval_ms.max(1));
            tokio::join!(engine.run(), engine.pump_frames(source, interval));
        }
        None => engine.run().await,
    }
    Ok(())
}

use crate::permissions::ToolPermissions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    #[default]
    Camera,
    Screen,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    // RMS of 16-bit samples; 800 is conservative for a typical mic.
    pub rms_threshold: u32,
    pub silence_window_ms: u64,
    // Samples per captured frame.
    pub frame_samples: usize,
    pub send_sample_rate_hz: u32,
    pub receive_sample_rate_hz: u32,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            rms_threshold: 800,
            silence_window_ms: 500,
            frame_samples: 1024,
            send_sample_rate_hz: 16_000,
            receive_sample_rate_hz: 24_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    // Chat entries replayed to the backend after a reconnect.
    pub history_limit: usize,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub start_message: Option<String>,
    pub video_mode: VideoMode,
    /// How often the camera or screen is grabbed.
    pub frame_interval_ms: u64,
    /// JPEG that an external camera grabber keeps overwriting.
    pub camera_snapshot: Option<String>,
    pub permissions: ToolPermissions,
    pub vad: VadSettings,
    pub reconnect: ReconnectSettings,
    pub outbound_queue_capacity: usize,
    pub max_pending_confirmations: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub projects_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".into(),
            voice_name: "Kore".into(),
            system_instruction: "You are a helpful voice assistant. Keep answers short and \
                                 use the available tools when the user asks for an action."
                .into(),
            start_message: None,
            video_mode: VideoMode::Camera,
            frame_interval_ms: 1000,
            camera_snapshot: None,
            // Read-only tools run without asking; everything else asks.
            permissions: ToolPermissions::new()
                .with("list_projects", false)
                .with("list_smart_devices", false)
                .with("discover_printers", false)
                .with("get_print_status", false),
            vad: VadSettings::default(),
            reconnect: ReconnectSettings::default(),
            outbound_queue_capacity: 10,
            max_pending_confirmations: 32,
            input_device: None,
            output_device: None,
            projects_dir: None,
        }
    }
}

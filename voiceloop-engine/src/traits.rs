use async_trait::async_trait;
use thiserror::Error;
use voiceloop_core::types::{ChatEntry, FunctionCall, FunctionResponse, ImagePayload, Speaker};

use crate::confirm::ConfirmationRequest;
use crate::supervisor::ConnectionState;
use crate::tools::ToolUpdate;

/// One typed event from the live backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    // PCM s16le at the receive sample rate.
    Audio(Vec<u8>),
    // Cumulative within the current turn.
    InputTranscript(String),
    OutputTranscript(String),
    ToolCall(Vec<FunctionCall>),
    TurnComplete,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Audio {
        pcm_s16le: Vec<u8>,
        sample_rate_hz: u32,
    },
    Image(ImagePayload),
    Text(String),
}

/// An item on a session's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send { payload: Payload, end_of_turn: bool },
    FunctionResponses(Vec<FunctionResponse>),
}

impl Outbound {
    pub fn text(text: impl Into<String>, end_of_turn: bool) -> Self {
        Self::Send {
            payload: Payload::Text(text.into()),
            end_of_turn,
        }
    }
}

#[async_trait]
pub trait LiveSender: Send {
    async fn send(&mut self, payload: Payload, end_of_turn: bool) -> anyhow::Result<()>;

    async fn send_function_responses(
        &mut self,
        responses: Vec<FunctionResponse>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait LiveReceiver: Send {
    /// `Ok(None)` means the backend closed the stream.
    async fn recv(&mut self) -> anyhow::Result<Option<ServerEvent>>;
}

/// Both halves of one live connection.
pub struct LiveChannel {
    pub sender: Box<dyn LiveSender>,
    pub receiver: Box<dyn LiveReceiver>,
}

#[async_trait]
pub trait LiveBackend: Send + Sync {
    async fn connect(&self) -> anyhow::Result<LiveChannel>;
}

/// Persistent conversation log (per project in the runtime implementation).
pub trait ChatLog: Send + Sync {
    fn log_chat(&self, sender: &str, text: &str) -> anyhow::Result<()>;

    /// Oldest first, at most `limit` entries.
    fn recent_chat_history(&self, limit: usize) -> anyhow::Result<Vec<ChatEntry>>;

    /// Name of the conversation the log currently writes to, if any.
    fn current_project(&self) -> Option<String> {
        None
    }
}

/// One-way notifications for the UI. Implementations must not block.
#[allow(unused_variables)]
pub trait EventSink: Send + Sync {
    fn on_transcription(&self, speaker: Speaker, delta: &str) {}
    fn on_tool_confirmation(&self, request: &ConfirmationRequest) {}
    fn on_audio_output(&self, pcm_s16le: &[u8]) {}
    fn on_tool_update(&self, tool: &str, update: &ToolUpdate) {}
    fn on_project_update(&self, project: &str) {}
    fn on_connection_state(&self, state: &ConnectionState) {}
    fn on_error(&self, message: &str) {}
}

pub struct NullSink;

impl EventSink for NullSink {}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    #[error("audio device I/O failed: {0}")]
    Io(String),
}

/// Blocking microphone stream producing PCM s16le mono frames.
pub trait AudioSource: Send {
    fn read(&mut self, frame_samples: usize) -> Result<Vec<u8>, DeviceError>;

    fn close(&mut self) {}
}

/// Blocking speaker stream consuming PCM s16le mono frames.
pub trait AudioSink: Send {
    fn write(&mut self, pcm_s16le: &[u8]) -> Result<(), DeviceError>;

    fn close(&mut self) {}
}

pub trait AudioDevices: Send + Sync {
    fn open_input(&self) -> Result<Box<dyn AudioSource>, DeviceError>;
    fn open_output(&self) -> Result<Box<dyn AudioSink>, DeviceError>;
}

/// Devices for headless runs: audio is reported unavailable and disabled.
pub struct NoAudio;

impl AudioDevices for NoAudio {
    fn open_input(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
        Err(DeviceError::Unavailable("audio disabled".into()))
    }

    fn open_output(&self) -> Result<Box<dyn AudioSink>, DeviceError> {
        Err(DeviceError::Unavailable("audio disabled".into()))
    }
}

/// A camera or screen grabber. `capture` blocks and returns one JPEG, or
/// `None` when nothing new is available.
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> anyhow::Result<Option<Vec<u8>>>;
}

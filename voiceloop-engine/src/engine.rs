use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use voiceloop_core::config::{AppConfig, VideoMode};
use voiceloop_core::permissions::ToolPermissions;
use voiceloop_core::types::{ImagePayload, RequestId};

use crate::confirm::ConfirmationBroker;
use crate::dispatch::ToolDispatcher;
use crate::frames;
use crate::session::SessionContext;
use crate::supervisor::{CurrentOutbound, Supervisor, SupervisorConfig};
use crate::tools::ToolRegistry;
use crate::traits::{AudioDevices, ChatLog, EventSink, FrameSource, LiveBackend, Outbound};
use crate::vad::frame_slot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("no live session is connected")]
    NotConnected,

    #[error("message is empty")]
    EmptyMessage,
}

/// Collaborators injected once at construction.
pub struct EngineDeps {
    pub backend: Arc<dyn LiveBackend>,
    pub devices: Arc<dyn AudioDevices>,
    pub chat_log: Arc<dyn ChatLog>,
    pub tools: ToolRegistry,
    pub sink: Arc<dyn EventSink>,
}

/// Public handle over the reconnecting live session.
///
/// Control methods are safe to call from any task while `run` is active.
pub struct VoiceloopEngine {
    supervisor: Supervisor,
    broker: Arc<ConfirmationBroker>,
    permissions: Arc<RwLock<ToolPermissions>>,
    frame_tx: watch::Sender<Option<ImagePayload>>,
    video_mode: VideoMode,
    paused: Arc<AtomicBool>,
    current: CurrentOutbound,
    stop: CancellationToken,
}

impl VoiceloopEngine {
    pub fn new(cfg: &AppConfig, deps: EngineDeps) -> Self {
        let broker = Arc::new(ConfirmationBroker::new(
            cfg.max_pending_confirmations,
            Arc::clone(&deps.sink),
        ));
        let permissions = Arc::new(RwLock::new(cfg.permissions.clone()));
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(deps.tools),
            Arc::clone(&permissions),
            Arc::clone(&broker),
            Arc::clone(&deps.sink),
        ));
        let (frame_tx, latest_frame) = frame_slot();
        let paused = Arc::new(AtomicBool::new(false));
        let current: CurrentOutbound = Arc::new(Mutex::new(None));

        let ctx = SessionContext {
            sink: deps.sink,
            chat_log: deps.chat_log,
            dispatcher,
            latest_frame,
            paused: Arc::clone(&paused),
            vad: cfg.vad.clone(),
        };
        let supervisor = Supervisor::new(
            deps.backend,
            deps.devices,
            ctx,
            Arc::clone(&broker),
            SupervisorConfig {
                reconnect: cfg.reconnect.clone(),
                outbound_capacity: cfg.outbound_queue_capacity,
                start_message: cfg.start_message.clone(),
            },
            Arc::clone(&current),
        );

        Self {
            supervisor,
            broker,
            permissions,
            frame_tx,
            video_mode: cfg.video_mode,
            paused,
            current,
            stop: CancellationToken::new(),
        }
    }

    /// Connects and keeps the session alive until `stop` is called.
    pub async fn run(&self) {
        self.supervisor.run(&self.stop).await;
    }

    pub fn stop(&self) {
        log::info!("stop requested");
        self.stop.cancel();
    }

    /// Answers a pending tool confirmation. Unknown ids are ignored.
    pub fn resolve_tool_confirmation(&self, id: &RequestId, approved: bool) -> bool {
        self.broker.resolve(id, approved)
    }

    pub fn pending_confirmations(&self) -> Vec<RequestId> {
        self.broker.pending_ids()
    }

    pub fn update_permissions(&self, update: &ToolPermissions) {
        self.permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(update);
    }

    /// Replaces the frame eligible for the next speech onset.
    pub fn submit_frame(&self, jpeg: &[u8]) {
        if self.video_mode == VideoMode::None {
            return;
        }
        self.frame_tx.send_replace(Some(ImagePayload::jpeg(jpeg)));
    }

    /// Refreshes the latest frame from `source` every `interval` until `stop`.
    ///
    /// Runs alongside `run`; does nothing when video is disabled.
    pub async fn pump_frames(&self, source: Arc<dyn FrameSource>, interval: Duration) {
        if self.video_mode == VideoMode::None {
            return;
        }
        frames::pump_frames(
            source,
            interval,
            Arc::clone(&self.paused),
            &self.frame_tx,
            self.stop.clone(),
        )
        .await;
    }

    /// Sends a typed user turn on the current session.
    pub async fn send_text(&self, text: &str) -> Result<(), EngineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let sender: Option<mpsc::Sender<Outbound>> = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            return Err(EngineError::NotConnected);
        };
        sender
            .send(Outbound::text(text, true))
            .await
            .map_err(|_| EngineError::NotConnected)
    }

    pub fn set_paused(&self, paused: bool) {
        log::info!("audio capture {}", if paused { "paused" } else { "resumed" });
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

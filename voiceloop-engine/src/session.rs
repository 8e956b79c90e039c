use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use voiceloop_core::config::VadSettings;
use voiceloop_core::types::{ChatEntry, FunctionCall, Speaker};

use crate::dispatch::ToolDispatcher;
use crate::playback::PlaybackQueue;
use crate::transcript::{Channel, ChatTurnBuffer, TranscriptTracker};
use crate::traits::{
    AudioSink, AudioSource, ChatLog, DeviceError, EventSink, LiveChannel, LiveReceiver,
    LiveSender, Outbound, ServerEvent,
};
use crate::vad::{FrameSlot, VadGate, capture_step};

const PAUSE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed by the backend")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("microphone failed: {0}")]
    Capture(DeviceError),

    #[error("speaker failed: {0}")]
    Playback(DeviceError),

    #[error("session task failed: {0}")]
    Task(String),
}

/// Shared collaborators every session of an engine uses.
#[derive(Clone)]
pub struct SessionContext {
    pub sink: Arc<dyn EventSink>,
    pub chat_log: Arc<dyn ChatLog>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub latest_frame: FrameSlot,
    pub paused: Arc<AtomicBool>,
    pub vad: VadSettings,
}

/// Audio handles for one session. `None` means that side is disabled.
#[derive(Default)]
pub struct SessionDevices {
    pub input: Option<Box<dyn AudioSource>>,
    pub output: Option<Box<dyn AudioSink>>,
}

/// One live connection and the pipelines running against it.
pub struct Session {
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
}

impl Session {
    pub fn new(outbound_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        Self {
            outbound_tx,
            outbound_rx,
        }
    }

    /// Producer handle for the outbound queue.
    pub fn outbound(&self) -> mpsc::Sender<Outbound> {
        self.outbound_tx.clone()
    }

    /// Runs send, capture, receive, playback and the tool worker until one of
    /// them fails or `stop` is cancelled.
    ///
    /// Returns `Ok(())` only when stopped. The first pipeline error cancels
    /// the others, and all of them are joined (closing devices) before this
    /// returns.
    pub async fn run(
        self,
        channel: LiveChannel,
        devices: SessionDevices,
        ctx: &SessionContext,
        stop: &CancellationToken,
    ) -> Result<(), SessionError> {
        let cancel = stop.child_token();
        let playback = Arc::new(PlaybackQueue::new());
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (chat_tx, chat_rx) = mpsc::unbounded_channel();
        let Session {
            outbound_tx,
            outbound_rx,
        } = self;

        let mut tasks: JoinSet<Result<(), SessionError>> = JoinSet::new();
        tasks.spawn(send_pipeline(channel.sender, outbound_rx, cancel.clone()));
        tasks.spawn(receive_pipeline(
            channel.receiver,
            InboundRouter::new(
                Arc::clone(&playback),
                tool_tx,
                Arc::clone(&ctx.sink),
                chat_tx,
            ),
            cancel.clone(),
        ));
        // Drains after the receiver finishes, so the log is complete once
        // `run` returns and a reconnect reads it.
        tasks.spawn(chat_log_writer(Arc::clone(&ctx.chat_log), chat_rx));
        tasks.spawn(tool_worker(
            Arc::clone(&ctx.dispatcher),
            tool_rx,
            outbound_tx.clone(),
            cancel.clone(),
        ));
        if let Some(input) = devices.input {
            tasks.spawn(capture_pipeline(
                input,
                outbound_tx.clone(),
                ctx.vad.clone(),
                ctx.latest_frame.clone(),
                Arc::clone(&ctx.paused),
                cancel.clone(),
            ));
        }
        tasks.spawn(playback_pipeline(
            devices.output,
            Arc::clone(&playback),
            Arc::clone(&ctx.sink),
            cancel.clone(),
        ));
        drop(outbound_tx);

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(SessionError::Task(e.to_string())));
            if let Err(e) = result {
                if first_error.is_none() {
                    log::warn!("session pipeline failed: {e}");
                    first_error = Some(e);
                } else {
                    log::debug!("additional pipeline error during teardown: {e}");
                }
                cancel.cancel();
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn send_pipeline(
    mut sender: Box<dyn LiveSender>,
    mut queue: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            item = queue.recv() => item,
        };
        let Some(item) = item else {
            return Ok(());
        };

        let sent = match item {
            Outbound::Send {
                payload,
                end_of_turn,
            } => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    r = sender.send(payload, end_of_turn) => r,
                }
            }
            Outbound::FunctionResponses(responses) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    r = sender.send_function_responses(responses) => r,
                }
            }
        };
        sent.map_err(|e| SessionError::Transport(format!("{e:#}")))?;
    }
}

async fn receive_pipeline(
    mut receiver: Box<dyn LiveReceiver>,
    mut router: InboundRouter,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let result = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            ev = receiver.recv() => ev,
        };
        match event {
            Ok(Some(event)) => router.handle(event),
            Ok(None) => break Err(SessionError::ConnectionClosed),
            Err(e) => break Err(SessionError::Transport(format!("{e:#}"))),
        }
    };
    router.finish();
    result
}

async fn chat_log_writer(
    chat_log: Arc<dyn ChatLog>,
    mut entries: mpsc::UnboundedReceiver<ChatEntry>,
) -> Result<(), SessionError> {
    while let Some(entry) = entries.recv().await {
        let log = Arc::clone(&chat_log);
        let written =
            tokio::task::spawn_blocking(move || log.log_chat(&entry.sender, &entry.text)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("failed to log chat entry: {e:#}"),
            Err(e) => log::warn!("chat log task failed: {e}"),
        }
    }
    Ok(())
}

async fn tool_worker(
    dispatcher: Arc<ToolDispatcher>,
    mut batches: mpsc::UnboundedReceiver<Vec<FunctionCall>>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    loop {
        let calls = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            calls = batches.recv() => calls,
        };
        let Some(calls) = calls else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = dispatcher.dispatch_batch(calls, &outbound) => {}
        }
    }
}

async fn capture_pipeline(
    mut input: Box<dyn AudioSource>,
    outbound: mpsc::Sender<Outbound>,
    vad: VadSettings,
    latest_frame: FrameSlot,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let mut gate = VadGate::from_settings(&vad);
    let frame_samples = vad.frame_samples;

    let result = 'capture: loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        if paused.load(Ordering::Relaxed) {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(PAUSE_POLL) => continue,
            }
        }

        // Device reads block; hand the source to the blocking pool and take
        // it back so it can still be closed on exit.
        let joined = tokio::task::spawn_blocking(move || {
            let read = input.read(frame_samples);
            (input, read)
        })
        .await;
        let (returned, read) = match joined {
            Ok(v) => v,
            Err(e) => return Err(SessionError::Task(format!("capture read panicked: {e}"))),
        };
        input = returned;

        let frame = match read {
            Ok(frame) => frame,
            Err(e) => break Err(SessionError::Capture(e)),
        };

        let now = tokio::time::Instant::now().into_std();
        for item in capture_step(&mut gate, frame, vad.send_sample_rate_hz, &latest_frame, now) {
            tokio::select! {
                _ = cancel.cancelled() => break 'capture Ok(()),
                sent = outbound.send(item) => {
                    if sent.is_err() {
                        break 'capture Ok(());
                    }
                }
            }
        }
    };

    input.close();
    result
}

async fn playback_pipeline(
    mut output: Option<Box<dyn AudioSink>>,
    queue: Arc<PlaybackQueue>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let result = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            frame = queue.pop() => frame,
        };
        sink.on_audio_output(&frame);

        let Some(mut device) = output.take() else {
            continue;
        };
        let joined = tokio::task::spawn_blocking(move || {
            let written = device.write(&frame);
            (device, written)
        })
        .await;
        let (device, written) = match joined {
            Ok(v) => v,
            Err(e) => return Err(SessionError::Task(format!("playback write panicked: {e}"))),
        };
        output = Some(device);
        if let Err(e) = written {
            break Err(SessionError::Playback(e));
        }
    };

    if let Some(mut device) = output {
        device.close();
    }
    result
}

/// Demultiplexes server events for one session.
pub struct InboundRouter {
    tracker: TranscriptTracker,
    chat: ChatTurnBuffer,
    playback: Arc<PlaybackQueue>,
    tools: mpsc::UnboundedSender<Vec<FunctionCall>>,
    sink: Arc<dyn EventSink>,
    chat_log: mpsc::UnboundedSender<ChatEntry>,
}

impl InboundRouter {
    /// Finished turns go to `chat_log`; the writer on the other end does the I/O.
    pub fn new(
        playback: Arc<PlaybackQueue>,
        tools: mpsc::UnboundedSender<Vec<FunctionCall>>,
        sink: Arc<dyn EventSink>,
        chat_log: mpsc::UnboundedSender<ChatEntry>,
    ) -> Self {
        Self {
            tracker: TranscriptTracker::new(),
            chat: ChatTurnBuffer::new(),
            playback,
            tools,
            sink,
            chat_log,
        }
    }

    pub fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Audio(pcm) => {
                if !pcm.is_empty() {
                    self.playback.push(pcm);
                }
            }
            ServerEvent::InputTranscript(text) => {
                let delta = self.tracker.delta(Channel::Input, &text);
                if delta.is_empty() {
                    return;
                }
                let dropped = self.playback.clear();
                if dropped > 0 {
                    log::debug!("barge-in: dropped {dropped} queued audio frame(s)");
                }
                self.transcript(Speaker::User, &delta);
            }
            ServerEvent::OutputTranscript(text) => {
                let delta = self.tracker.delta(Channel::Output, &text);
                if !delta.is_empty() {
                    self.transcript(Speaker::Assistant, &delta);
                }
            }
            ServerEvent::ToolCall(calls) => {
                if calls.is_empty() {
                    return;
                }
                if self.tools.send(calls).is_err() {
                    log::warn!("tool worker gone; dropping tool call batch");
                }
            }
            ServerEvent::TurnComplete => {
                if let Some(entry) = self.chat.take() {
                    self.persist(entry);
                }
                self.tracker.reset();
            }
            ServerEvent::Interrupted => {
                let dropped = self.playback.clear();
                log::debug!("backend interrupted; dropped {dropped} queued audio frame(s)");
            }
        }
    }

    /// Flushes whatever turn is still open.
    pub fn finish(&mut self) {
        if let Some(entry) = self.chat.take() {
            self.persist(entry);
        }
    }

    fn transcript(&mut self, speaker: Speaker, delta: &str) {
        self.sink.on_transcription(speaker, delta);
        if let Some(entry) = self.chat.push(speaker, delta) {
            self.persist(entry);
        }
    }

    fn persist(&self, entry: ChatEntry) {
        if self.chat_log.send(entry).is_err() {
            log::warn!("chat log writer gone; dropping entry");
        }
    }
}

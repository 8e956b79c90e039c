use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use voiceloop_core::config::ReconnectSettings;
use voiceloop_core::text::reconnect_context;

use crate::confirm::ConfirmationBroker;
use crate::session::{Session, SessionContext, SessionDevices, SessionError};
use crate::traits::{AudioDevices, LiveBackend, LiveChannel, Outbound, Payload};

/// Exponential backoff: `min(base * 2^k, ceiling)` after `k` consecutive
/// failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            failures: 0,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    /// Current delay (after `failures()` consecutive failures).
    pub fn current(&self) -> Duration {
        self.delay_for(self.failures)
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting { attempt: u32 },
    Connected { reconnect: bool },
    Backoff { delay_ms: u64 },
    Stopped,
}

/// Outbound handle of whichever session is current.
pub type CurrentOutbound = Arc<Mutex<Option<mpsc::Sender<Outbound>>>>;

pub struct SupervisorConfig {
    pub reconnect: ReconnectSettings,
    pub outbound_capacity: usize,
    pub start_message: Option<String>,
}

enum Attempt {
    Stopped,
    Failed(String),
}

/// Keeps one session alive, reconnecting with backoff until stopped.
pub struct Supervisor {
    backend: Arc<dyn LiveBackend>,
    devices: Arc<dyn AudioDevices>,
    ctx: SessionContext,
    broker: Arc<ConfirmationBroker>,
    cfg: SupervisorConfig,
    current: CurrentOutbound,
}

#[derive(Debug, Clone, Copy)]
struct AudioAvailability {
    input: bool,
    output: bool,
}

impl Supervisor {
    pub fn new(
        backend: Arc<dyn LiveBackend>,
        devices: Arc<dyn AudioDevices>,
        ctx: SessionContext,
        broker: Arc<ConfirmationBroker>,
        cfg: SupervisorConfig,
        current: CurrentOutbound,
    ) -> Self {
        Self {
            backend,
            devices,
            ctx,
            broker,
            cfg,
            current,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("connection state: {state:?}");
        self.ctx.sink.on_connection_state(&state);
    }

    /// Runs until `stop` is cancelled.
    pub async fn run(&self, stop: &CancellationToken) {
        let mut backoff = Backoff::from_settings(&self.cfg.reconnect);
        let mut audio = AudioAvailability {
            input: true,
            output: true,
        };
        let mut attempt: u32 = 0;
        let mut after_failure = false;

        while !stop.is_cancelled() {
            attempt = attempt.saturating_add(1);
            self.set_state(ConnectionState::Connecting { attempt });

            match self
                .run_attempt(stop, after_failure, &mut audio, &mut backoff)
                .await
            {
                Attempt::Stopped => break,
                Attempt::Failed(message) => {
                    log::warn!("live session ended: {message}");
                    self.ctx.sink.on_error(&message);
                }
            }

            self.broker.abandon_all();
            after_failure = true;
            if stop.is_cancelled() {
                break;
            }

            let delay = backoff.on_failure();
            self.set_state(ConnectionState::Backoff {
                delay_ms: delay.as_millis() as u64,
            });
            log::info!("reconnecting in {:.1}s", delay.as_secs_f32());
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.broker.abandon_all();
        self.set_state(ConnectionState::Stopped);
        log::info!("supervisor stopped");
    }

    async fn run_attempt(
        &self,
        stop: &CancellationToken,
        reconnect: bool,
        audio: &mut AudioAvailability,
        backoff: &mut Backoff,
    ) -> Attempt {
        let connected = tokio::select! {
            _ = stop.cancelled() => return Attempt::Stopped,
            r = self.backend.connect() => r,
        };
        let mut channel = match connected {
            Ok(channel) => channel,
            Err(e) => return Attempt::Failed(format!("connect failed: {e:#}")),
        };

        if let Err(e) = self.greet(&mut channel, reconnect).await {
            return Attempt::Failed(format!("{e:#}"));
        }

        backoff.reset();
        self.set_state(ConnectionState::Connected { reconnect });
        log::info!("live session connected (reconnect: {reconnect})");

        let devices = self.open_devices(audio);
        let session = Session::new(self.cfg.outbound_capacity);
        self.publish(Some(session.outbound()));
        let result = session.run(channel, devices, &self.ctx, stop).await;
        self.publish(None);

        match result {
            Ok(()) => Attempt::Stopped,
            Err(e) => {
                match &e {
                    SessionError::Capture(_) => {
                        audio.input = false;
                        log::warn!("disabling microphone for the rest of this run");
                    }
                    SessionError::Playback(_) => {
                        audio.output = false;
                        log::warn!("disabling speaker for the rest of this run");
                    }
                    _ => {}
                }
                Attempt::Failed(e.to_string())
            }
        }
    }

    /// Sends the reconnect context, or the start message on a first
    /// connection, before any live traffic.
    async fn greet(&self, channel: &mut LiveChannel, reconnect: bool) -> anyhow::Result<()> {
        if reconnect {
            let history = self
                .ctx
                .chat_log
                .recent_chat_history(self.cfg.reconnect.history_limit)
                .unwrap_or_else(|e| {
                    log::warn!("could not load chat history for reconnect: {e:#}");
                    Vec::new()
                });
            log::info!("restoring context with {} chat entries", history.len());
            channel
                .sender
                .send(Payload::Text(reconnect_context(&history)), true)
                .await?;
            return Ok(());
        }

        if let Some(project) = self.ctx.chat_log.current_project() {
            self.ctx.sink.on_project_update(&project);
        }
        if let Some(message) = self.cfg.start_message.as_deref() {
            if !message.trim().is_empty() {
                channel
                    .sender
                    .send(Payload::Text(message.to_string()), true)
                    .await?;
            }
        }
        Ok(())
    }

    fn open_devices(&self, audio: &mut AudioAvailability) -> SessionDevices {
        let mut devices = SessionDevices::default();
        if audio.input {
            match self.devices.open_input() {
                Ok(input) => devices.input = Some(input),
                Err(e) => {
                    audio.input = false;
                    log::warn!("microphone disabled: {e}");
                    self.ctx.sink.on_error(&format!("Microphone disabled: {e}"));
                }
            }
        }
        if audio.output {
            match self.devices.open_output() {
                Ok(output) => devices.output = Some(output),
                Err(e) => {
                    audio.output = false;
                    log::warn!("speaker disabled: {e}");
                    self.ctx.sink.on_error(&format!("Speaker disabled: {e}"));
                }
            }
        }
        devices
    }

    fn publish(&self, outbound: Option<mpsc::Sender<Outbound>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = outbound;
    }
}

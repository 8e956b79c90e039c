use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;
use voiceloop_core::types::FunctionResponse;
use voiceloop_engine::traits::{
    LiveBackend, LiveChannel, LiveReceiver, LiveSender, Payload, ServerEvent,
};

use crate::protocol::{
    ParsedServer, SetupParams, build_payload_message, build_setup_message,
    build_tool_response_message, parse_server_message,
};

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const API_KEY_HEADER: &str = "x-goog-api-key";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, PartialEq)]
pub struct LiveConfig {
    pub ws_url: Url,
    pub api_key: String,
    pub setup: SetupParams,

    pub connect_timeout: Duration,
    // How long to wait for `setupComplete` after sending the setup message.
    pub setup_timeout: Duration,
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("ws_url", &self.ws_url.as_str())
            .field("api_key", &"[REDACTED]")
            .field("setup", &self.setup)
            .field("connect_timeout", &self.connect_timeout)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

impl LiveConfig {
    pub fn production(api_key: impl Into<String>, setup: SetupParams) -> anyhow::Result<Self> {
        Ok(Self {
            ws_url: Url::parse(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent",
            )
            .context("parse live api url")?,
            api_key: api_key.into(),
            setup,
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(10),
        })
    }
}

/// Opens a fresh websocket session on every `connect`.
pub struct GeminiLiveBackend {
    cfg: LiveConfig,
}

impl GeminiLiveBackend {
    pub fn new(cfg: LiveConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl LiveBackend for GeminiLiveBackend {
    async fn connect(&self) -> anyhow::Result<LiveChannel> {
        connect_live_session(&self.cfg).await
    }
}

pub async fn connect_live_session(cfg: &LiveConfig) -> anyhow::Result<LiveChannel> {
    if cfg.api_key.trim().is_empty() {
        return Err(anyhow!("missing Gemini API key"));
    }

    let mut req = cfg
        .ws_url
        .as_str()
        .into_client_request()
        .context("build websocket request")?;
    req.headers_mut().insert(
        API_KEY_HEADER,
        cfg.api_key
            .parse()
            .map_err(|_| anyhow!("invalid API key header"))?,
    );

    let (mut ws, _resp) =
        tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| anyhow!("live api connect timed out"))?
            .context("connect live api websocket")?;

    tokio::time::timeout(cfg.setup_timeout, handshake(&mut ws, &cfg.setup))
        .await
        .map_err(|_| anyhow!("live api setup timed out"))??;
    log::info!("live session set up (model {})", cfg.setup.model);

    let (ws_write, ws_read) = ws.split();

    // Client messages share one FIFO; pongs go on a separate control lane so
    // they are never stuck behind queued audio.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Message>(8);
    tokio::spawn(async move {
        let mut ws_write = ws_write;

        loop {
            let next: Option<Message> = tokio::select! {
                biased;
                msg = ctrl_rx.recv() => msg,
                msg = out_rx.recv() => msg,
            };

            // Either half going away means the session is over.
            let Some(msg) = next else {
                break;
            };

            let res = tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(msg)).await;
            if !matches!(res, Ok(Ok(()))) {
                log::warn!("live websocket write failed; closing writer");
                break;
            }
        }

        let _ = ws_write.send(Message::Close(None)).await;
    });

    Ok(LiveChannel {
        sender: Box::new(LiveWsSender { out: out_tx }),
        receiver: Box::new(LiveWsReceiver {
            read: ws_read,
            ctrl: ctrl_tx,
            pending: VecDeque::new(),
        }),
    })
}

async fn handshake(ws: &mut WsStream, setup: &SetupParams) -> anyhow::Result<()> {
    ws.send(Message::Text(build_setup_message(setup).into()))
        .await
        .context("send live setup")?;

    while let Some(msg) = ws.next().await {
        let text = match msg.context("read live setup reply")? {
            Message::Text(t) => t.to_string(),
            Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
            Message::Close(frame) => {
                return Err(anyhow!("live api closed during setup: {frame:?}"));
            }
            _ => continue,
        };
        if let Ok(ParsedServer::SetupComplete) = parse_server_message(&text) {
            return Ok(());
        }
        log::debug!("ignoring frame before setupComplete");
    }
    Err(anyhow!("live api closed during setup"))
}

struct LiveWsSender {
    out: mpsc::Sender<Message>,
}

impl LiveWsSender {
    async fn push(&self, text: String) -> anyhow::Result<()> {
        tokio::time::timeout(WS_SEND_TIMEOUT, self.out.send(Message::Text(text.into())))
            .await
            .map_err(|_| anyhow!("live websocket send timed out"))?
            .map_err(|_| anyhow!("live websocket closed"))
    }
}

#[async_trait]
impl LiveSender for LiveWsSender {
    async fn send(&mut self, payload: Payload, end_of_turn: bool) -> anyhow::Result<()> {
        self.push(build_payload_message(&payload, end_of_turn)).await
    }

    async fn send_function_responses(
        &mut self,
        responses: Vec<FunctionResponse>,
    ) -> anyhow::Result<()> {
        self.push(build_tool_response_message(&responses)).await
    }
}

struct LiveWsReceiver {
    read: SplitStream<WsStream>,
    ctrl: mpsc::Sender<Message>,
    // One frame can carry several events.
    pending: VecDeque<ServerEvent>,
}

#[async_trait]
impl LiveReceiver for LiveWsReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<ServerEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(msg) = self.read.next().await else {
                return Ok(None);
            };
            let text = match msg.context("live websocket read failed")? {
                Message::Text(t) => t.to_string(),
                Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                Message::Close(frame) => {
                    log::info!("live api closed the session: {frame:?}");
                    return Ok(None);
                }
                Message::Ping(p) => {
                    if self.ctrl.try_send(Message::Pong(p)).is_err() {
                        return Err(anyhow!("failed to send pong"));
                    }
                    continue;
                }
                _ => continue,
            };

            match parse_server_message(&text) {
                Ok(ParsedServer::Events(events)) => self.pending.extend(events),
                Ok(ParsedServer::GoAway { time_left }) => {
                    log::warn!(
                        "live api will close the session soon (time left: {})",
                        time_left.as_deref().unwrap_or("unknown")
                    );
                }
                Ok(ParsedServer::SetupComplete | ParsedServer::Ignored) => {}
                Err(e) => log::debug!("ignoring undecodable live frame: {e:#}"),
            }
        }
    }
}

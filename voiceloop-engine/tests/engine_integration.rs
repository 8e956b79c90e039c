use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use voiceloop_core::config::AppConfig;
use voiceloop_core::text::DENIED_RESULT;
use voiceloop_core::types::{ChatEntry, FunctionCall, FunctionResponse};
use voiceloop_engine::confirm::ConfirmationRequest;
use voiceloop_engine::engine::{EngineDeps, VoiceloopEngine};
use voiceloop_engine::supervisor::ConnectionState;
use voiceloop_engine::tools::{ToolContext, ToolHandler, ToolRegistry};
use voiceloop_engine::traits::{
    AudioDevices, AudioSink, AudioSource, ChatLog, DeviceError, EventSink, LiveBackend,
    LiveChannel, LiveReceiver, LiveSender, NoAudio, Payload, ServerEvent,
};

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text(String, bool),
    Audio,
    Image,
    Responses(Vec<FunctionResponse>),
}

type SentLog = Arc<Mutex<Vec<(usize, Sent)>>>;

enum Plan {
    Fail,
    Open(mpsc::UnboundedReceiver<ServerEvent>),
}

struct FakeBackend {
    plans: Mutex<VecDeque<Plan>>,
    connects: AtomicUsize,
    sent: SentLog,
}

impl FakeBackend {
    fn new(plans: Vec<Plan>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            connects: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn sent_on(&self, conn: usize) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, s)| s.clone())
            .collect()
    }

    fn all_sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

#[async_trait::async_trait]
impl LiveBackend for FakeBackend {
    async fn connect(&self) -> anyhow::Result<LiveChannel> {
        let conn = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Fail);
        match plan {
            Plan::Fail => anyhow::bail!("connection refused (attempt {conn})"),
            Plan::Open(events) => Ok(LiveChannel {
                sender: Box::new(FakeSender {
                    conn,
                    sent: Arc::clone(&self.sent),
                }),
                receiver: Box::new(FakeReceiver { events }),
            }),
        }
    }
}

struct FakeSender {
    conn: usize,
    sent: SentLog,
}

#[async_trait::async_trait]
impl LiveSender for FakeSender {
    async fn send(&mut self, payload: Payload, end_of_turn: bool) -> anyhow::Result<()> {
        let item = match payload {
            Payload::Text(t) => Sent::Text(t, end_of_turn),
            Payload::Audio { .. } => Sent::Audio,
            Payload::Image(_) => Sent::Image,
        };
        self.sent.lock().unwrap().push((self.conn, item));
        Ok(())
    }

    async fn send_function_responses(
        &mut self,
        responses: Vec<FunctionResponse>,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((self.conn, Sent::Responses(responses)));
        Ok(())
    }
}

struct FakeReceiver {
    events: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait::async_trait]
impl LiveReceiver for FakeReceiver {
    async fn recv(&mut self) -> anyhow::Result<Option<ServerEvent>> {
        Ok(self.events.recv().await)
    }
}

#[derive(Default)]
struct MemLog(Mutex<Vec<ChatEntry>>);

impl ChatLog for MemLog {
    fn log_chat(&self, sender: &str, text: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(ChatEntry::new(sender, text));
        Ok(())
    }

    fn recent_chat_history(&self, limit: usize) -> anyhow::Result<Vec<ChatEntry>> {
        let all = self.0.lock().unwrap();
        Ok(all[all.len().saturating_sub(limit)..].to_vec())
    }
}

struct TestSink {
    states: mpsc::UnboundedSender<ConnectionState>,
    confirmations: mpsc::UnboundedSender<ConfirmationRequest>,
}

impl EventSink for TestSink {
    fn on_connection_state(&self, state: &ConnectionState) {
        let _ = self.states.send(state.clone());
    }

    fn on_tool_confirmation(&self, request: &ConfirmationRequest) {
        let _ = self.confirmations.send(request.clone());
    }
}

struct Events {
    states: mpsc::UnboundedReceiver<ConnectionState>,
    confirmations: mpsc::UnboundedReceiver<ConfirmationRequest>,
}

fn test_sink() -> (Arc<TestSink>, Events) {
    let (states_tx, states) = mpsc::unbounded_channel();
    let (conf_tx, confirmations) = mpsc::unbounded_channel();
    (
        Arc::new(TestSink {
            states: states_tx,
            confirmations: conf_tx,
        }),
        Events {
            states,
            confirmations,
        },
    )
}

impl Events {
    /// Collects states up to and including the first one matching `pred`.
    async fn states_until(&mut self, pred: impl Fn(&ConnectionState) -> bool) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        while let Some(s) = self.states.recv().await {
            let done = pred(&s);
            seen.push(s);
            if done {
                return seen;
            }
        }
        panic!("state stream ended; saw {seen:?}");
    }
}

struct SilentMic {
    frames: Arc<AtomicUsize>,
}

impl AudioSource for SilentMic {
    fn read(&mut self, frame_samples: usize) -> Result<Vec<u8>, DeviceError> {
        std::thread::sleep(Duration::from_millis(1));
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0u8; frame_samples * 2])
    }
}

struct NullSpeaker;

impl AudioSink for NullSpeaker {
    fn write(&mut self, _pcm_s16le: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }
}

struct QuietRoom {
    frames: Arc<AtomicUsize>,
}

impl AudioDevices for QuietRoom {
    fn open_input(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
        Ok(Box::new(SilentMic {
            frames: Arc::clone(&self.frames),
        }))
    }

    fn open_output(&self) -> Result<Box<dyn AudioSink>, DeviceError> {
        Ok(Box::new(NullSpeaker))
    }
}

struct CountingLight {
    invocations: AtomicUsize,
}

#[async_trait::async_trait]
impl ToolHandler for CountingLight {
    fn name(&self) -> &str {
        "control_light"
    }

    fn description(&self) -> &str {
        "Turns a light on or off."
    }

    async fn invoke(&self, _args: &serde_json::Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok("done".into())
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_silent_seconds_send_no_video() {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let backend = FakeBackend::new(vec![Plan::Open(events_rx)]);
    let frames = Arc::new(AtomicUsize::new(0));
    let (sink, _events) = test_sink();

    let engine = Arc::new(VoiceloopEngine::new(
        &AppConfig::default(),
        EngineDeps {
            backend: backend.clone(),
            devices: Arc::new(QuietRoom {
                frames: Arc::clone(&frames),
            }),
            chat_log: Arc::new(MemLog::default()),
            tools: ToolRegistry::new(),
            sink,
        },
    ));
    engine.submit_frame(b"\xff\xd8fake-jpeg");

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    // 1024-sample frames at 16 kHz: 79 frames is just over five seconds.
    wait_for("five seconds of captured audio", || {
        frames.load(Ordering::SeqCst) >= 79
    })
    .await;
    wait_for("audio to reach the backend", || {
        backend.all_sent().iter().filter(|s| **s == Sent::Audio).count() >= 79
    })
    .await;

    engine.stop();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine stops")
        .unwrap();

    let sent = backend.all_sent();
    assert!(!sent.contains(&Sent::Image));
    assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    drop(events_tx);
}

#[tokio::test]
async fn denied_light_control_answers_without_touching_the_device() {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let backend = FakeBackend::new(vec![Plan::Open(events_rx)]);
    let light = Arc::new(CountingLight {
        invocations: AtomicUsize::new(0),
    });
    let (sink, mut events) = test_sink();

    let engine = Arc::new(VoiceloopEngine::new(
        &AppConfig::default(),
        EngineDeps {
            backend: backend.clone(),
            devices: Arc::new(NoAudio),
            chat_log: Arc::new(MemLog::default()),
            tools: ToolRegistry::new().with(light.clone()),
            sink,
        },
    ));
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    events
        .states_until(|s| matches!(s, ConnectionState::Connected { .. }))
        .await;

    events_tx
        .send(ServerEvent::ToolCall(vec![FunctionCall {
            id: "call-1".into(),
            name: "control_light".into(),
            args: serde_json::json!({"target": "Office Light", "action": "turn_on"}),
        }]))
        .unwrap();

    let request = events.confirmations.recv().await.unwrap();
    assert_eq!(request.tool, "control_light");
    assert_eq!(request.args["target"], "Office Light");

    // Nothing goes back while the user is deciding.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(backend.all_sent().is_empty());

    assert!(engine.resolve_tool_confirmation(&request.id, false));
    wait_for("the denial response", || !backend.all_sent().is_empty()).await;

    assert_eq!(
        backend.all_sent(),
        vec![Sent::Responses(vec![FunctionResponse {
            id: "call-1".into(),
            name: "control_light".into(),
            result: DENIED_RESULT.into(),
        }])]
    );
    assert_eq!(light.invocations.load(Ordering::SeqCst), 0);
    // A second answer for the same request is ignored.
    assert!(!engine.resolve_tool_confirmation(&request.id, true));

    engine.stop();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_and_restores_recent_history_first() {
    let (first_tx, first_rx) = mpsc::unbounded_channel();
    let (_live_tx, live_rx) = mpsc::unbounded_channel();
    // First session drops right away, then four refused connects.
    drop(first_tx);
    let backend = FakeBackend::new(vec![
        Plan::Open(first_rx),
        Plan::Fail,
        Plan::Fail,
        Plan::Fail,
        Plan::Fail,
        Plan::Open(live_rx),
    ]);

    let log = Arc::new(MemLog::default());
    for i in 1..=12 {
        let sender = if i % 2 == 1 { "User" } else { "Assistant" };
        log.log_chat(sender, &format!("message {i:02}")).unwrap();
    }

    let mut cfg = AppConfig::default();
    cfg.start_message = Some("Hello!".into());
    let (sink, mut events) = test_sink();
    let engine = Arc::new(VoiceloopEngine::new(
        &cfg,
        EngineDeps {
            backend: backend.clone(),
            devices: Arc::new(NoAudio),
            chat_log: log,
            tools: ToolRegistry::new(),
            sink,
        },
    ));

    let t0 = tokio::time::Instant::now();
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    let states = events
        .states_until(|s| *s == ConnectionState::Connected { reconnect: true })
        .await;
    let delays: Vec<u64> = states
        .iter()
        .filter_map(|s| match s {
            ConnectionState::Backoff { delay_ms } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000]);
    assert!(t0.elapsed() >= Duration::from_secs(25));
    assert_eq!(backend.connects.load(Ordering::SeqCst), 6);

    engine.send_text("are you there?").await.unwrap();
    wait_for("the typed text", || backend.sent_on(6).len() >= 2).await;

    assert_eq!(backend.sent_on(1), vec![Sent::Text("Hello!".into(), true)]);

    let live = backend.sent_on(6);
    let Sent::Text(context, true) = &live[0] else {
        panic!("expected reconnect context first, got {:?}", live[0]);
    };
    assert!(context.starts_with("System Notification: Connection was lost"));
    assert!(!context.contains("message 01"));
    assert!(!context.contains("message 02"));
    for i in 3..=12 {
        assert!(context.contains(&format!("message {i:02}")), "missing entry {i}");
    }
    assert!(context.find("[User]: message 03") < context.find("[Assistant]: message 12"));
    assert_eq!(live[1], Sent::Text("are you there?".into(), true));

    engine.stop();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_prevents_further_attempts() {
    let backend = FakeBackend::new(vec![]);
    let (sink, mut events) = test_sink();
    let engine = Arc::new(VoiceloopEngine::new(
        &AppConfig::default(),
        EngineDeps {
            backend: backend.clone(),
            devices: Arc::new(NoAudio),
            chat_log: Arc::new(MemLog::default()),
            tools: ToolRegistry::new(),
            sink,
        },
    ));
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    events
        .states_until(|s| matches!(s, ConnectionState::Backoff { .. }))
        .await;
    engine.stop();
    runner.await.unwrap();

    assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    let rest = events.states_until(|s| *s == ConnectionState::Stopped).await;
    assert_eq!(rest, vec![ConnectionState::Stopped]);
    assert!(matches!(
        engine.send_text("hello").await,
        Err(voiceloop_engine::engine::EngineError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn dropped_session_abandons_pending_confirmation() {
    let (first_tx, first_rx) = mpsc::unbounded_channel();
    let (_live_tx, live_rx) = mpsc::unbounded_channel();
    let backend = FakeBackend::new(vec![Plan::Open(first_rx), Plan::Open(live_rx)]);
    let light = Arc::new(CountingLight {
        invocations: AtomicUsize::new(0),
    });
    let (sink, mut events) = test_sink();

    let engine = Arc::new(VoiceloopEngine::new(
        &AppConfig::default(),
        EngineDeps {
            backend: backend.clone(),
            devices: Arc::new(NoAudio),
            chat_log: Arc::new(MemLog::default()),
            tools: ToolRegistry::new().with(light.clone()),
            sink,
        },
    ));
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    events
        .states_until(|s| matches!(s, ConnectionState::Connected { .. }))
        .await;
    first_tx
        .send(ServerEvent::InputTranscript("turn on the office light".into()))
        .unwrap();
    first_tx
        .send(ServerEvent::ToolCall(vec![FunctionCall {
            id: "call-1".into(),
            name: "control_light".into(),
            args: serde_json::json!({"target": "Office Light", "action": "turn_on"}),
        }]))
        .unwrap();

    let request = events.confirmations.recv().await.unwrap();
    assert_eq!(engine.pending_confirmations(), vec![request.id.clone()]);

    // The backend goes away while the user is still deciding.
    drop(first_tx);
    events
        .states_until(|s| *s == ConnectionState::Connected { reconnect: true })
        .await;

    assert!(engine.pending_confirmations().is_empty());
    assert!(!engine.resolve_tool_confirmation(&request.id, true));

    engine.send_text("still there?").await.unwrap();
    wait_for("the typed text", || backend.sent_on(2).len() >= 2).await;

    let live = backend.sent_on(2);
    let Sent::Text(context, true) = &live[0] else {
        panic!("expected reconnect context first, got {:?}", live[0]);
    };
    // The open user turn was flushed to the log before reconnecting.
    assert!(context.contains("[User]: turn on the office light"));
    assert_eq!(live[1], Sent::Text("still there?".into(), true));
    assert!(
        !backend
            .all_sent()
            .iter()
            .any(|s| matches!(s, Sent::Responses(_)))
    );
    assert_eq!(light.invocations.load(Ordering::SeqCst), 0);

    engine.stop();
    runner.await.unwrap();
}

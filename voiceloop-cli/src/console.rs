use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use voiceloop_core::permissions::ToolPermissions;
use voiceloop_core::types::{RequestId, Speaker};
use voiceloop_engine::confirm::ConfirmationRequest;
use voiceloop_engine::engine::VoiceloopEngine;
use voiceloop_engine::supervisor::ConnectionState;
use voiceloop_engine::tools::ToolUpdate;
use voiceloop_engine::traits::EventSink;

pub const HELP: &str = "\
commands:
  y [id]             approve a pending tool call (id optional when only one is pending)
  n [id]             deny a pending tool call
  t <text>           send a typed message
  p                  pause / resume the microphone
  allow <tool>       stop asking before <tool> runs
  ask <tool>         ask again before <tool> runs
  pending            list pending confirmations
  q                  quit";

/// Prints engine events to the terminal.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn on_transcription(&self, speaker: Speaker, delta: &str) {
        println!("[{}] {delta}", speaker.label());
    }

    fn on_tool_confirmation(&self, request: &ConfirmationRequest) {
        println!(
            "[confirm] {} {}\n          approve: y {id}   deny: n {id}",
            request.tool,
            request.args,
            id = request.id
        );
    }

    fn on_tool_update(&self, tool: &str, update: &ToolUpdate) {
        match update {
            ToolUpdate::Status(s) => println!("[{tool}] status: {s}"),
            ToolUpdate::Thought(t) => println!("[{tool}] {}", t.trim_end()),
            ToolUpdate::Log(l) => println!("[{tool}] {l}"),
            ToolUpdate::Data(v) => log::debug!("{tool} data: {v}"),
        }
    }

    fn on_project_update(&self, project: &str) {
        println!("[project] {project}");
    }

    fn on_connection_state(&self, state: &ConnectionState) {
        match state {
            ConnectionState::Connecting { attempt } => println!("[link] connecting (attempt {attempt})"),
            ConnectionState::Connected { reconnect: true } => println!("[link] reconnected"),
            ConnectionState::Connected { reconnect: false } => println!("[link] connected"),
            ConnectionState::Backoff { delay_ms } => println!("[link] retrying in {delay_ms} ms"),
            ConnectionState::Stopped => println!("[link] stopped"),
        }
    }

    fn on_error(&self, message: &str) {
        eprintln!("[error] {message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Resolve { id: Option<String>, approved: bool },
    Text(String),
    TogglePause,
    Permission { tool: String, ask: bool },
    Pending,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    Some(match head {
        "y" | "yes" => Command::Resolve {
            id: arg,
            approved: true,
        },
        "n" | "no" => Command::Resolve {
            id: arg,
            approved: false,
        },
        "t" | "say" => Command::Text(arg?),
        "p" | "pause" => Command::TogglePause,
        "allow" => Command::Permission {
            tool: arg?,
            ask: false,
        },
        "ask" => Command::Permission {
            tool: arg?,
            ask: true,
        },
        "pending" => Command::Pending,
        "h" | "help" | "?" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        _ => return None,
    })
}

async fn execute(engine: &VoiceloopEngine, cmd: Command) -> bool {
    match cmd {
        Command::Resolve { id, approved } => {
            let id = match id {
                Some(raw) => RequestId::parse(&raw),
                None => {
                    let pending = engine.pending_confirmations();
                    if pending.len() > 1 {
                        println!("{} confirmations pending; give an id", pending.len());
                    }
                    (pending.len() == 1).then(|| pending[0].clone())
                }
            };
            match id {
                Some(id) if engine.resolve_tool_confirmation(&id, approved) => {}
                _ => println!("no such pending confirmation"),
            }
        }
        Command::Text(text) => {
            if let Err(e) = engine.send_text(&text).await {
                println!("not sent: {e}");
            }
        }
        Command::TogglePause => {
            let paused = !engine.is_paused();
            engine.set_paused(paused);
            println!("microphone {}", if paused { "paused" } else { "live" });
        }
        Command::Permission { tool, ask } => {
            engine.update_permissions(&ToolPermissions::new().with(tool.clone(), ask));
            println!("{tool}: {}", if ask { "ask first" } else { "allowed" });
        }
        Command::Pending => {
            for id in engine.pending_confirmations() {
                println!("{id}");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

/// Reads commands from stdin. `q` stops the engine; end of input only ends the loop.
pub async fn command_loop(engine: Arc<VoiceloopEngine>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::debug!("stdin closed; commands disabled");
                return;
            }
            Err(e) => {
                log::warn!("stdin read failed: {e}");
                return;
            }
        };
        match parse_command(&line) {
            Some(cmd) => {
                if !execute(&engine, cmd).await {
                    break;
                }
            }
            None => println!("unknown command; type 'help'"),
        }
    }
    engine.stop();
}

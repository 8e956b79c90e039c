use anyhow::{Context, anyhow};
use base64::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use voiceloop_core::types::{FunctionCall, FunctionResponse};
use voiceloop_engine::tools::ToolDeclaration;
use voiceloop_engine::traits::{Payload, ServerEvent};

/// Session parameters sent once, right after the socket opens.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupParams {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
}

pub fn build_setup_message(p: &SetupParams) -> String {
    let mut setup = json!({
        "model": p.model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": p.voice_name } }
            }
        },
        "inputAudioTranscription": {},
        "outputAudioTranscription": {},
    });

    if let Some(map) = setup.as_object_mut() {
        if !p.system_instruction.trim().is_empty() {
            map.insert(
                "systemInstruction".into(),
                json!({ "parts": [{ "text": p.system_instruction }] }),
            );
        }
        if !p.tools.is_empty() {
            let decls: Vec<Value> = p
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            map.insert("tools".into(), json!([{ "functionDeclarations": decls }]));
        }
    }

    json!({ "setup": setup }).to_string()
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn pcm_mime(sample_rate_hz: u32) -> String {
    format!("audio/pcm;rate={sample_rate_hz}")
}

/// Streams media as realtime input. A payload that ends the turn (and any
/// text) is sent as client content instead, so the model starts answering.
pub fn build_payload_message(payload: &Payload, end_of_turn: bool) -> String {
    let part = match payload {
        Payload::Text(text) => json!({ "text": text }),
        Payload::Audio {
            pcm_s16le,
            sample_rate_hz,
        } => {
            let blob = json!({ "mimeType": pcm_mime(*sample_rate_hz), "data": b64(pcm_s16le) });
            if !end_of_turn {
                return json!({ "realtimeInput": { "audio": blob } }).to_string();
            }
            json!({ "inlineData": blob })
        }
        Payload::Image(image) => {
            let blob = json!({ "mimeType": image.mime_type, "data": image.data });
            if !end_of_turn {
                return json!({ "realtimeInput": { "video": blob } }).to_string();
            }
            json!({ "inlineData": blob })
        }
    };

    json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [part] }],
            "turnComplete": end_of_turn,
        }
    })
    .to_string()
}

pub fn build_tool_response_message(responses: &[FunctionResponse]) -> String {
    let items: Vec<Value> = responses
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "response": { "result": r.result },
            })
        })
        .collect();
    json!({ "toolResponse": { "functionResponses": items } }).to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedServer {
    SetupComplete,
    Events(Vec<ServerEvent>),
    GoAway { time_left: Option<String> },
    Ignored,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMsg>,
    go_away: Option<GoAwayMsg>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMsg {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayMsg {
    time_left: Option<String>,
}

/// Decodes one server frame into engine events, in the order they should be
/// handled: user transcript, assistant audio, assistant transcript, then
/// interruption and turn end.
pub fn parse_server_message(s: &str) -> anyhow::Result<ParsedServer> {
    let msg: ServerMessage = serde_json::from_str(s).context("decode live server json")?;

    if msg.setup_complete.is_some() {
        return Ok(ParsedServer::SetupComplete);
    }
    if let Some(go_away) = msg.go_away {
        return Ok(ParsedServer::GoAway {
            time_left: go_away.time_left,
        });
    }

    let mut events = Vec::new();
    if let Some(content) = msg.server_content {
        if let Some(t) = content.input_transcription {
            if !t.text.is_empty() {
                events.push(ServerEvent::InputTranscript(t.text));
            }
        }
        for part in content.model_turn.map(|m| m.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if !inline.mime_type.starts_with("audio/") {
                continue;
            }
            let pcm = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| anyhow!("invalid base64 audio: {e}"))?;
            events.push(ServerEvent::Audio(pcm));
        }
        if let Some(t) = content.output_transcription {
            if !t.text.is_empty() {
                events.push(ServerEvent::OutputTranscript(t.text));
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }
    if let Some(call) = msg.tool_call {
        if !call.function_calls.is_empty() {
            events.push(ServerEvent::ToolCall(call.function_calls));
        }
    }

    if events.is_empty() {
        return Ok(ParsedServer::Ignored);
    }
    Ok(ParsedServer::Events(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use voiceloop_core::types::ImagePayload;

    fn value(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn setup_carries_voice_instruction_and_tools() {
        let msg = value(&build_setup_message(&SetupParams {
            model: "models/live".into(),
            voice_name: "Kore".into(),
            system_instruction: "Be brief.".into(),
            tools: vec![ToolDeclaration {
                name: "list_projects".into(),
                description: "Lists projects.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
        }));
        let setup = &msg["setup"];
        assert_eq!(setup["model"], "models/live");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(setup["tools"][0]["functionDeclarations"][0]["name"], "list_projects");
        assert!(setup["inputAudioTranscription"].is_object());
    }

    #[test]
    fn setup_omits_empty_sections() {
        let msg = value(&build_setup_message(&SetupParams {
            model: "m".into(),
            voice_name: "Puck".into(),
            system_instruction: " ".into(),
            tools: vec![],
        }));
        assert!(msg["setup"].get("systemInstruction").is_none());
        assert!(msg["setup"].get("tools").is_none());
    }

    #[test]
    fn audio_streams_as_realtime_input() {
        let msg = value(&build_payload_message(
            &Payload::Audio {
                pcm_s16le: vec![1, 0, 2, 0],
                sample_rate_hz: 16_000,
            },
            false,
        ));
        assert_eq!(msg["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(msg["realtimeInput"]["audio"]["data"], "AQACAA==");
    }

    #[test]
    fn image_streams_as_video_frame() {
        let msg = value(&build_payload_message(
            &Payload::Image(ImagePayload::jpeg(b"jpg")),
            false,
        ));
        assert_eq!(msg["realtimeInput"]["video"]["mimeType"], "image/jpeg");
    }

    #[test]
    fn text_is_client_content_with_turn_flag() {
        let msg = value(&build_payload_message(&Payload::Text("hi".into()), true));
        assert_eq!(msg["clientContent"]["turns"][0]["parts"][0]["text"], "hi");
        assert_eq!(msg["clientContent"]["turnComplete"], true);

        let msg = value(&build_payload_message(&Payload::Text("ctx".into()), false));
        assert_eq!(msg["clientContent"]["turnComplete"], false);
    }

    #[test]
    fn tool_responses_wrap_result() {
        let msg = value(&build_tool_response_message(&[FunctionResponse {
            id: "c1".into(),
            name: "control_light".into(),
            result: "ok".into(),
        }]));
        let r = &msg["toolResponse"]["functionResponses"][0];
        assert_eq!(r["id"], "c1");
        assert_eq!(r["response"]["result"], "ok");
    }

    #[test]
    fn parses_server_content_in_handling_order() {
        let parsed = parse_server_message(
            r#"{"serverContent":{
                "inputTranscription":{"text":"hello"},
                "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}},{"text":"ignored"}]},
                "outputTranscription":{"text":"Hi!"},
                "turnComplete":true}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            ParsedServer::Events(vec![
                ServerEvent::InputTranscript("hello".into()),
                ServerEvent::Audio(vec![1, 2]),
                ServerEvent::OutputTranscript("Hi!".into()),
                ServerEvent::TurnComplete,
            ])
        );
    }

    #[test]
    fn parses_tool_calls_and_interruptions() {
        let parsed = parse_server_message(
            r#"{"toolCall":{"functionCalls":[{"id":"1","name":"control_light","args":{"target":"Office Light"}}]}}"#,
        )
        .unwrap();
        let ParsedServer::Events(events) = parsed else {
            panic!("expected events");
        };
        let ServerEvent::ToolCall(calls) = &events[0] else {
            panic!("expected tool call");
        };
        assert_eq!(calls[0].str_arg("target"), Some("Office Light"));

        assert_eq!(
            parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap(),
            ParsedServer::Events(vec![ServerEvent::Interrupted])
        );
    }

    #[test]
    fn parses_control_frames() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            ParsedServer::SetupComplete
        );
        assert_eq!(
            parse_server_message(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap(),
            ParsedServer::GoAway {
                time_left: Some("10s".into())
            }
        );
        assert_eq!(
            parse_server_message(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap(),
            ParsedServer::Ignored
        );
        assert!(parse_server_message("not json").is_err());
    }
}

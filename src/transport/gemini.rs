//! # Live API WebSocket Connector
//!
//! Bidirectional streaming client for the `BidiGenerateContent` live endpoint.
//!
//! ## Protocol:
//! 1. **Connect**: open the WebSocket with the API key in the query string
//! 2. **Setup**: send the setup frame (model, audio reply modality, voice, persona)
//! 3. **Handshake**: the server answers `setupComplete`
//! 4. **Stream**: captured audio goes out as `realtimeInput`; replies come back
//!    as `serverContent` carrying inline audio, `interrupted` or `turnComplete`
//! 5. **Close**: a Close frame ends the session
//!
//! The server sends JSON in Binary frames as well as Text frames; both are
//! parsed the same way.

use crate::error::TransportError;
use crate::transport::{
    CloseConnection, Connector, InboundEvent, LiveConnection, OutboundMessage, ServerMessage,
    SetupParams,
};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Default live endpoint.
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Client frames ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SetupFrame {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_chunks: Vec<MediaChunk<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    audio_stream_end: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: String,
    data: &'a str,
}

/// JSON for the session-open frame.
pub fn setup_frame(setup: &SetupParams) -> Result<String, serde_json::Error> {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };
    let system_instruction = (!setup.persona.is_empty()).then(|| Content {
        parts: vec![TextPart {
            text: setup.persona.clone(),
        }],
    });

    serde_json::to_string(&SetupFrame {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
        },
    })
}

/// JSON for one outbound message, or `None` for messages that are not JSON.
pub fn outbound_frame(message: &OutboundMessage) -> Result<Option<String>, serde_json::Error> {
    let input = match message {
        OutboundMessage::Audio(frame) => RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.mime_type(),
                data: &frame.data,
            }],
            audio_stream_end: false,
        },
        OutboundMessage::AudioStreamEnd => RealtimeInput {
            media_chunks: Vec::new(),
            audio_stream_end: true,
        },
        OutboundMessage::Close => return Ok(None),
    };
    serde_json::to_string(&RealtimeInputFrame {
        realtime_input: input,
    })
    .map(Some)
}

// ── Server frames ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerFault>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    model_turn: Option<ModelTurn>,
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

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct ServerFault {
    message: Option<String>,
}

/// Translate one server JSON document into session events, in order.
///
/// ## Errors:
/// Returns the parse error for text that is not a server frame; the caller
/// logs and skips it.
pub fn parse_server_frame(text: &str) -> Result<Vec<InboundEvent>, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if frame.setup_complete.is_some() {
        events.push(InboundEvent::Opened);
    }

    if let Some(content) = frame.server_content {
        let audio = content
            .model_turn
            .map(|turn| {
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data.map(|d| d.data))
                    .collect()
            })
            .unwrap_or_default();
        let message = ServerMessage {
            audio,
            interrupted: content.interrupted,
            turn_complete: content.turn_complete,
        };
        if !message.is_empty() {
            events.push(InboundEvent::Message(message));
        }
    }

    if let Some(fault) = frame.error {
        let message = fault
            .message
            .unwrap_or_else(|| "unknown server error".to_string());
        events.push(InboundEvent::Failed(TransportError::Server(message)));
    }

    Ok(events)
}

/// Text of a frame that carries JSON, whether sent as Text or Binary.
fn json_payload(message: &WsMessage) -> Option<&str> {
    match message {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

// ── Connector ────────────────────────────────────────────────────

/// [`Connector`] for the live WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    endpoint: String,
    outbound_queue: usize,
}

impl GeminiConnector {
    /// ## Parameters:
    /// - **endpoint**: WebSocket URL without the key parameter
    /// - **outbound_queue**: frames that may wait for the socket before new ones are dropped
    pub fn new(endpoint: impl Into<String>, outbound_queue: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            outbound_queue: outbound_queue.max(1),
        }
    }

    fn url(&self, credential: &str) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{separator}key={credential}", self.endpoint)
    }
}

impl Default for GeminiConnector {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT, 64)
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(
        &self,
        credential: &str,
        setup: &SetupParams,
    ) -> Result<LiveConnection, TransportError> {
        info!(endpoint = %self.endpoint, model = %setup.model, voice = %setup.voice, "Connecting to live endpoint");

        let (mut ws, _response) = tokio_tungstenite::connect_async(self.url(credential))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let setup_json = setup_frame(setup).map_err(|e| TransportError::Connect(e.to_string()))?;
        ws.send(WsMessage::Text(setup_json))
            .await
            .map_err(|e| TransportError::Connect(format!("failed to send setup: {e}")))?;
        debug!("Setup frame sent, waiting for setupComplete");

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        tokio::spawn(outbound_loop(outbound_rx, sink));
        tokio::spawn(inbound_loop(stream, inbound_tx));

        Ok(LiveConnection {
            outbound: outbound_tx.clone(),
            inbound: inbound_rx,
            closer: Some(Box::new(SocketCloser {
                outbound: outbound_tx,
            })),
        })
    }
}

/// Closes the socket by queueing a Close frame behind pending audio.
struct SocketCloser {
    outbound: mpsc::Sender<OutboundMessage>,
}

#[async_trait]
impl CloseConnection for SocketCloser {
    async fn close(&self) -> Result<(), TransportError> {
        self.outbound
            .send(OutboundMessage::Close)
            .await
            .map_err(|_| TransportError::Socket("connection already closed".to_string()))
    }
}

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut sink: SplitSink<WsStream, WsMessage>,
) {
    let mut sent: u64 = 0;

    while let Some(message) = rx.recv().await {
        let json = match outbound_frame(&message) {
            Ok(Some(json)) => json,
            Ok(None) => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                continue;
            }
        };

        if let Err(e) = sink.send(WsMessage::Text(json)).await {
            // One failed send is dropped; a dead socket also surfaces on the inbound side
            warn!(error = %e, "WebSocket send failed");
            continue;
        }
        sent += 1;
        if sent == 1 || sent % 50 == 0 {
            debug!(sent, "Outbound frames sent");
        }
    }

    debug!(sent, "Outbound loop terminated");
}

async fn inbound_loop(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<InboundEvent>) {
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                let _ = tx
                    .send(InboundEvent::Failed(TransportError::Socket(e.to_string())))
                    .await;
                return;
            }
        };

        if let WsMessage::Close(close) = &message {
            let reason = close
                .as_ref()
                .map(|c| c.reason.to_string())
                .filter(|r| !r.is_empty());
            info!(reason = ?reason, "Live endpoint closed the connection");
            let _ = tx.send(InboundEvent::Closed { reason }).await;
            return;
        }

        let Some(text) = json_payload(&message) else {
            if let WsMessage::Binary(data) = &message {
                warn!(len = data.len(), "Skipping non-JSON binary frame");
            }
            continue;
        };

        match parse_server_frame(text) {
            Ok(events) => {
                for event in events {
                    if tx.send(event).await.is_err() {
                        debug!("Session dropped the inbound channel");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Skipping unparseable server frame"),
        }
    }

    let _ = tx.send(InboundEvent::Closed { reason: None }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::WireFrame;
    use tokio::net::TcpListener;

    fn params() -> SetupParams {
        SetupParams {
            model: "gemini-live-test".into(),
            voice: "Puck".into(),
            persona: "You are a calm interviewer.".into(),
        }
    }

    #[test]
    fn test_setup_frame_layout() {
        let json: serde_json::Value = serde_json::from_str(&setup_frame(&params()).unwrap()).unwrap();

        assert_eq!(json["setup"]["model"], "models/gemini-live-test");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "You are a calm interviewer."
        );
    }

    #[test]
    fn test_audio_frame_layout() {
        let frame = WireFrame {
            data: "AAEC".into(),
            sample_rate: 16000,
        };
        let json = outbound_frame(&OutboundMessage::Audio(frame)).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&json).unwrap();

        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAEC");
        assert!(json["realtimeInput"].get("audioStreamEnd").is_none());

        let end = outbound_frame(&OutboundMessage::AudioStreamEnd).unwrap().unwrap();
        assert_eq!(end, r#"{"realtimeInput":{"audioStreamEnd":true}}"#);
        assert_eq!(outbound_frame(&OutboundMessage::Close).unwrap(), None);
    }

    #[test]
    fn test_parse_reply_audio_and_interruption() {
        let events = parse_server_frame(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
                {"text":"hi"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQA="}}
            ]}}}"#,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![InboundEvent::Message(ServerMessage {
                audio: vec!["AAA=".into(), "AQA=".into()],
                interrupted: false,
                turn_complete: false,
            })]
        );

        let events = parse_server_frame(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(
            events,
            vec![InboundEvent::Message(ServerMessage {
                interrupted: true,
                ..Default::default()
            })]
        );
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(
            parse_server_frame(r#"{"setupComplete":{}}"#).unwrap(),
            vec![InboundEvent::Opened]
        );
        assert_eq!(
            parse_server_frame(r#"{"error":{"message":"quota exceeded"}}"#).unwrap(),
            vec![InboundEvent::Failed(TransportError::Server(
                "quota exceeded".into()
            ))]
        );
        assert!(parse_server_frame(r#"{"usageMetadata":{}}"#).unwrap().is_empty());
        assert!(parse_server_frame("not json").is_err());
    }

    #[test]
    fn test_json_payload_accepts_binary_json_only() {
        assert_eq!(json_payload(&WsMessage::Text("{}".into())), Some("{}"));
        assert_eq!(json_payload(&WsMessage::Binary(b"{\"a\":1}".to_vec())), Some("{\"a\":1}"));
        assert_eq!(json_payload(&WsMessage::Binary(vec![0, 1, 2])), None);
    }

    #[test]
    fn test_url_carries_key() {
        let connector = GeminiConnector::new("ws://localhost:9/live", 8);
        assert_eq!(connector.url("abc"), "ws://localhost:9/live?key=abc");
        let connector = GeminiConnector::new("ws://localhost:9/live?alt=json", 8);
        assert_eq!(connector.url("abc"), "ws://localhost:9/live?alt=json&key=abc");
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.to_text().unwrap().contains("\"setup\""));

            ws.send(WsMessage::Binary(br#"{"setupComplete":{}}"#.to_vec()))
                .await
                .unwrap();
            ws.send(WsMessage::Text(
                r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#
                    .into(),
            ))
            .await
            .unwrap();

            let audio = ws.next().await.unwrap().unwrap();
            let audio = audio.to_text().unwrap().to_string();

            // Client close, then the handshake reply is flushed by tungstenite
            let close = ws.next().await.unwrap().unwrap();
            assert!(close.is_close());
            audio
        });

        let connector = GeminiConnector::new(format!("ws://{addr}/live"), 4);
        let mut connection = connector.connect("test-key", &params()).await.unwrap();

        assert_eq!(connection.inbound.recv().await, Some(InboundEvent::Opened));
        assert_eq!(
            connection.inbound.recv().await,
            Some(InboundEvent::Message(ServerMessage {
                audio: vec!["AAA=".into()],
                ..Default::default()
            }))
        );

        connection
            .outbound
            .try_send(OutboundMessage::Audio(WireFrame {
                data: "AAEC".into(),
                sample_rate: 16000,
            }))
            .unwrap();
        connection.closer.as_ref().unwrap().close().await.unwrap();

        let audio = server.await.unwrap();
        assert!(audio.contains("mediaChunks"));
        assert!(audio.contains("AAEC"));
    }
}

//! # Gemini Live Adapter
//!
//! Implements the session capability over the Gemini Live WebSocket API.
//!
//! ## Connection Lifecycle:
//! 1. **Connect**: open the WebSocket with the API key as query parameter
//! 2. **Setup**: send model, voice, system instruction, transcription switches
//! 3. **Handshake**: wait for `setupComplete` before handing out a handle
//! 4. **Streaming**: a writer task drains queued audio onto the socket while a
//!    reader task turns server messages into [`SessionEvent`]s
//! 5. **Close**: send a close frame, wait for the writer, stop the reader

use crate::config::SessionConfig;
use crate::error::BridgeError;
use crate::session::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::session::{EncodedAudio, SessionConnector, SessionEvent, SessionEventSender, SessionHandle};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Opens Gemini Live sessions.
#[derive(Debug, Default, Clone)]
pub struct GeminiConnector;

impl GeminiConnector {
    pub fn new() -> Self {
        Self
    }
}

enum Outbound {
    Audio(String),
    Close,
}

/// What a single WebSocket frame turned out to be.
enum Inbound {
    Server(ServerMessage),
    Closed(String),
    Ignore,
}

fn classify(frame: Message) -> Result<Inbound, String> {
    match frame {
        Message::Text(text) => serde_json::from_str(&text)
            .map(Inbound::Server)
            .map_err(|e| format!("invalid server message: {}", e)),
        // the service sends its JSON in binary frames
        Message::Binary(bytes) => serde_json::from_slice(&bytes)
            .map(Inbound::Server)
            .map_err(|e| format!("invalid server message: {}", e)),
        Message::Close(frame) => Ok(Inbound::Closed(
            frame
                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                .unwrap_or_else(|| "no close frame".to_string()),
        )),
        _ => Ok(Inbound::Ignore),
    }
}

#[async_trait]
impl SessionConnector for GeminiConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionHandle>, BridgeError> {
        if config.api_key.trim().is_empty() {
            return Err(BridgeError::SessionHandshakeFailed(
                "no API key configured (set GEMINI_API_KEY)".to_string(),
            ));
        }

        let url = format!("{}?key={}", config.endpoint, config.api_key);
        info!(endpoint = %config.endpoint, model = %config.model, "Opening realtime session");

        let (socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| BridgeError::SessionHandshakeFailed(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| BridgeError::SessionHandshakeFailed(format!("setup encode: {}", e)))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| BridgeError::SessionHandshakeFailed(e.to_string()))?;

        // Nothing may be sent until the server acknowledges the setup
        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(BridgeError::SessionHandshakeFailed(e.to_string())),
                None => {
                    return Err(BridgeError::SessionHandshakeFailed(
                        "connection ended before setup completed".to_string(),
                    ))
                }
            };
            match classify(frame).map_err(BridgeError::SessionHandshakeFailed)? {
                Inbound::Server(msg) if msg.setup_complete.is_some() => break,
                Inbound::Server(_) | Inbound::Ignore => continue,
                Inbound::Closed(reason) => {
                    return Err(BridgeError::SessionHandshakeFailed(format!(
                        "server closed during setup: {}",
                        reason
                    )))
                }
            }
        }
        info!("Realtime session established");

        let closing = Arc::new(AtomicBool::new(false));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer_events = events.clone();
        let writer_closing = closing.clone();
        let writer = tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Audio(json) => {
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            if !writer_closing.load(Ordering::SeqCst) {
                                error!("Realtime session write failed: {}", e);
                                let _ = writer_events.send(SessionEvent::Error(e.to_string()));
                            }
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            debug!("Realtime session writer finished");
        });

        let reader_closing = closing.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        if !reader_closing.load(Ordering::SeqCst) {
                            error!("Realtime session read failed: {}", e);
                            let _ = events.send(SessionEvent::Error(e.to_string()));
                        }
                        return;
                    }
                };

                match classify(frame) {
                    Ok(Inbound::Server(msg)) => {
                        if let Some(content) = msg.server_content {
                            for event in content.into_events() {
                                if events.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        if msg.go_away.is_some() {
                            warn!("Realtime session announced it is going away");
                        }
                    }
                    Ok(Inbound::Closed(reason)) => {
                        if !reader_closing.load(Ordering::SeqCst) {
                            info!(reason = %reason, "Realtime session closed by server");
                            let _ = events.send(SessionEvent::Closed);
                        }
                        return;
                    }
                    Ok(Inbound::Ignore) => {}
                    Err(e) => warn!("Skipping realtime message: {}", e),
                }
            }

            if !reader_closing.load(Ordering::SeqCst) {
                let _ = events.send(SessionEvent::Closed);
            }
        });

        Ok(Box::new(GeminiSession {
            outbound: out_tx,
            closing,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

/// Handle to an established Gemini Live session.
pub struct GeminiSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SessionHandle for GeminiSession {
    fn send_audio(&self, audio: EncodedAudio) -> Result<(), BridgeError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("session is closing".to_string()));
        }
        let json = serde_json::to_string(&RealtimeInputMessage::from(audio))
            .map_err(|e| BridgeError::Transport(format!("audio encode: {}", e)))?;
        self.outbound
            .send(Outbound::Audio(json))
            .map_err(|_| BridgeError::Transport("session writer has stopped".to_string()))
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(Outbound::Close);

        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        info!("Realtime session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::future::Future;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Accept one WebSocket client on a local port and hand it to `script`.
    /// Returns the session config pointing at it.
    async fn scripted_server<F, Fut>(script: F) -> SessionConfig
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = accept_async(tcp).await.unwrap();
            script(ws).await;
        });

        let mut config = crate::config::AppConfig::default().session;
        config.endpoint = format!("ws://127.0.0.1:{}/live", port);
        config.api_key = "test-key".to_string();
        config
    }

    async fn next_json(ws: &mut ServerSocket) -> Option<Value> {
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_session_handshake_audio_and_remote_close() {
        let (seen_tx, mut seen) = mpsc::unbounded_channel::<Value>();
        let acked = Arc::new(AtomicBool::new(false));
        let server_acked = acked.clone();

        let config = scripted_server(move |mut ws| async move {
            let setup = next_json(&mut ws).await.unwrap();
            let _ = seen_tx.send(setup);

            // traffic before the acknowledgement is not surfaced
            let early = r#"{"serverContent": {"inputTranscription": {"text": "too early"}}}"#;
            ws.send(Message::Text(early.to_string())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            server_acked.store(true, Ordering::SeqCst);
            ws.send(Message::Binary(br#"{"setupComplete": {}}"#.to_vec())).await.unwrap();

            let audio = next_json(&mut ws).await.unwrap();
            let _ = seen_tx.send(audio);

            let content = r#"{"serverContent": {
                "inputTranscription": {"text": "hello"},
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQID"}}]},
                "turnComplete": true
            }}"#;
            ws.send(Message::Text(content.to_string())).await.unwrap();
            ws.send(Message::Close(None)).await.unwrap();
            while ws.next().await.is_some() {}
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = GeminiConnector::new().connect(&config, tx).await.unwrap();
        assert!(acked.load(Ordering::SeqCst));

        let setup = seen.recv().await.unwrap();
        assert_eq!(setup["setup"]["model"], config.model.as_str());
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(setup["setup"]["inputAudioTranscription"].is_object());
        assert!(setup["setup"]["outputAudioTranscription"].is_object());

        session
            .send_audio(EncodedAudio {
                data: "AAAA".to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            })
            .unwrap();
        let audio = timeout(Duration::from_secs(2), seen.recv()).await.unwrap().unwrap();
        assert_eq!(audio["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(audio["realtimeInput"]["audio"]["data"], "AAAA");

        assert_eq!(next_event(&mut rx).await, SessionEvent::InputTranscription("hello".to_string()));
        assert_eq!(next_event(&mut rx).await, SessionEvent::TurnComplete);
        assert_eq!(next_event(&mut rx).await, SessionEvent::Audio("AQID".to_string()));
        assert_eq!(next_event(&mut rx).await, SessionEvent::Closed);

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_during_setup_fails_handshake() {
        let config = scripted_server(|mut ws| async move {
            let _ = next_json(&mut ws).await;
            let _ = ws.send(Message::Close(None)).await;
            while ws.next().await.is_some() {}
        })
        .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = GeminiConnector::new().connect(&config, tx).await.err().unwrap();
        match err {
            BridgeError::SessionHandshakeFailed(message) => assert!(message.contains("closed during setup")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_close_emits_no_closed_event() {
        let (closed_tx, closed) = tokio::sync::oneshot::channel::<bool>();
        let config = scripted_server(move |mut ws| async move {
            let _ = next_json(&mut ws).await;
            ws.send(Message::Text(r#"{"setupComplete": {}}"#.to_string())).await.unwrap();
            let mut saw_close = false;
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    saw_close = true;
                    break;
                }
            }
            let _ = closed_tx.send(saw_close);
        })
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = GeminiConnector::new().connect(&config, tx).await.unwrap();
        session.close().await;

        assert!(timeout(Duration::from_secs(2), closed).await.unwrap().unwrap());
        let after = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(after, Ok(Some(_))));

        let refused = session.send_audio(EncodedAudio {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        assert!(matches!(refused, Err(BridgeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_handshake() {
        let config = crate::config::AppConfig::default().session;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = GeminiConnector::new().connect(&config, tx).await.err().unwrap();
        assert!(matches!(err, BridgeError::SessionHandshakeFailed(_)));
    }

    #[test]
    fn test_classify_binary_json() {
        let frame = Message::Binary(br#"{"setupComplete": {}}"#.to_vec());
        match classify(frame).unwrap() {
            Inbound::Server(msg) => assert!(msg.setup_complete.is_some()),
            _ => panic!("expected a server message"),
        }
    }

    #[test]
    fn test_classify_garbage_is_an_error() {
        assert!(classify(Message::Text("not json".to_string())).is_err());
        assert!(matches!(classify(Message::Ping(vec![1])).unwrap(), Inbound::Ignore));
    }
}

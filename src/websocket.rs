//! # Bridge Event Stream
//!
//! Clients connect to `/ws/events` to follow the bridge live and to drive it.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current status is pushed immediately
//! 2. **Events**: every [`BridgeEvent`] is forwarded as tagged JSON
//!    (`status`, `input_transcript`, `output_transcript`, `turn_complete`,
//!    `interrupted`, `error`)
//! 3. **Commands**: `{"type": "connect"}` and `{"type": "disconnect"}` run the
//!    workflows; the outcome comes back as a `command_result`
//! 4. **Heartbeat**: the server sends `ping` every 30 s and drops clients that have
//!    been silent for 60 s; a client `ping` is answered with `pong`

use crate::controller::BridgeEvent;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect,
    Disconnect,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages produced by the socket itself, next to the forwarded bridge events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    CommandResult {
        command: String,
        success: bool,
        message: String,
    },
    Error { code: String, message: String },
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub struct EventsWebSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl EventsWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, msg: &ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    /// Run a connect or disconnect on the bridge task and report back to this client.
    fn run_command(&self, command: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let bridge = self.state.bridge.clone();
        let config = self.state.get_config();
        let addr = ctx.address();

        tokio::spawn(async move {
            let (name, outcome) = match command {
                ClientMessage::Connect => (
                    "connect",
                    bridge.connect(config).await.map(|s| s.status_line),
                ),
                _ => ("disconnect", bridge.disconnect().await.map(|s| s.status_line)),
            };

            let reply = match outcome {
                Ok(message) => ServerMessage::CommandResult {
                    command: name.to_string(),
                    success: true,
                    message,
                },
                Err(e) => ServerMessage::CommandResult {
                    command: name.to_string(),
                    success: false,
                    message: e.to_string(),
                },
            };

            if let Ok(json) = serde_json::to_string(&reply) {
                addr.do_send(SendText(json));
            }
        });
    }
}

/// Message for sending text to the WebSocket client.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

impl Actor for EventsWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Event stream client connected");

        if let Ok(json) = serde_json::to_string(&BridgeEvent::Status(self.state.bridge.status())) {
            ctx.text(json);
        }
        ctx.add_stream(BroadcastStream::new(self.state.bridge.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Event stream heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            act.send(&ServerMessage::Ping { timestamp: now_millis() }, ctx);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Event stream client disconnected");
    }
}

/// Bridge events, forwarded verbatim.
impl StreamHandler<Result<BridgeEvent, BroadcastStreamRecvError>> for EventsWebSocket {
    fn handle(&mut self, item: Result<BridgeEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    ctx.text(json);
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream client lagging, events skipped");
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Bridge event stream ended");
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for EventsWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping { timestamp }) => {
                        self.send(&ServerMessage::Pong { timestamp }, ctx);
                    }
                    Ok(ClientMessage::Pong { .. }) => {}
                    Ok(command) => self.run_command(command, ctx),
                    Err(err) => self.send(
                        &ServerMessage::Error {
                            code: "invalid_json".to_string(),
                            message: format!("Invalid message: {}", err),
                        },
                        ctx,
                    ),
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.send(
                    &ServerMessage::Error {
                        code: "unsupported".to_string(),
                        message: "Binary frames are not accepted".to_string(),
                    },
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Event stream closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendText> for EventsWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Upgrade `GET /ws/events` to a WebSocket.
pub async fn events_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New event stream request from: {:?}", req.connection_info().peer_addr());
    ws::start(EventsWebSocket::new(app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "connect"}"#).unwrap(),
            ClientMessage::Connect
        ));
        assert!(matches!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "ping", "timestamp": 42}"#).unwrap(),
            ClientMessage::Ping { timestamp: 42 }
        ));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "start_session"}"#).is_err());
    }

    #[test]
    fn test_command_result_shape() {
        let msg = ServerMessage::CommandResult {
            command: "connect".to_string(),
            success: false,
            message: "Pairing failed: no device matched".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command_result");
        assert_eq!(json["success"], false);
    }
}

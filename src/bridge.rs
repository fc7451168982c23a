//! # Bridge Task
//!
//! Runs the [`SessionController`] on a single tokio task and exposes it to the
//! rest of the service through a cloneable [`BridgeHandle`].
//!
//! ## Message Sources:
//! - **Commands**: connect / disconnect / shutdown from HTTP and WebSocket clients
//! - **Notifications**: microphone payloads from the hardware link
//! - **Session events**: transcripts, audio and control traffic from the AI session
//! - **Playback ends**: natural completion of scheduled units
//!
//! Each source is drained in arrival order and only one message is handled at a
//! time. A connect that hangs holds up the task, not the HTTP workers; the caller
//! waiting on the reply is the only one who notices.

use crate::audio::output::OutputFactory;
use crate::config::AppConfig;
use crate::controller::{BridgeEvent, BridgeStatus, ChatMessage, ControllerInbox, SessionController};
use crate::error::BridgeError;
use crate::hardware::LinkFactory;
use crate::session::SessionConnector;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 256;

pub enum BridgeCommand {
    Connect {
        config: Box<AppConfig>,
        reply: oneshot::Sender<Result<BridgeStatus, BridgeError>>,
    },
    Disconnect {
        reply: oneshot::Sender<BridgeStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable access to the running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
    status: Arc<RwLock<BridgeStatus>>,
    history: Arc<RwLock<Vec<ChatMessage>>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    /// Run the connect workflow with the given configuration and wait for it to finish.
    pub async fn connect(&self, config: AppConfig) -> Result<BridgeStatus, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeCommand::Connect {
            config: Box::new(config),
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn disconnect(&self) -> Result<BridgeStatus, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeCommand::Disconnect { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Disconnect everything and stop the task.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    async fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands.send(command).await.map_err(|_| stopped())
    }

    /// Latest published status.
    pub fn status(&self) -> BridgeStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Finalized transcript records, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}

fn stopped() -> BridgeError {
    BridgeError::InvalidState("bridge task is not running".to_string())
}

/// Start the bridge task.
pub fn spawn_bridge(
    links: LinkFactory,
    connector: Arc<dyn SessionConnector>,
    outputs: OutputFactory,
) -> (BridgeHandle, JoinHandle<()>) {
    let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (events, _) = broadcast::channel(EVENT_QUEUE);
    let status = Arc::new(RwLock::new(BridgeStatus::default()));
    let history = Arc::new(RwLock::new(Vec::new()));

    let (controller, inbox) = SessionController::new(links, connector, outputs, events.clone());

    let handle = BridgeHandle {
        commands: commands_tx,
        status: status.clone(),
        history: history.clone(),
        events,
    };

    let task = tokio::spawn(run(controller, inbox, commands, status, history));
    (handle, task)
}

async fn run(
    mut controller: SessionController,
    mut inbox: ControllerInbox,
    mut commands: mpsc::Receiver<BridgeCommand>,
    status: Arc<RwLock<BridgeStatus>>,
    history: Arc<RwLock<Vec<ChatMessage>>>,
) {
    info!("Bridge task started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(BridgeCommand::Connect { config, reply }) => {
                        let result = controller.connect_all(&config).await.map(|_| controller.snapshot());
                        publish(&controller, &status, &history);
                        let _ = reply.send(result);
                    }
                    Some(BridgeCommand::Disconnect { reply }) => {
                        controller.disconnect_all().await;
                        publish(&controller, &status, &history);
                        let _ = reply.send(controller.snapshot());
                    }
                    Some(BridgeCommand::Shutdown { reply }) => {
                        controller.disconnect_all().await;
                        publish(&controller, &status, &history);
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("All bridge handles dropped");
                        controller.disconnect_all().await;
                        break;
                    }
                }
            }
            Some((generation, payload)) = inbox.notifications.recv() => {
                controller.on_notification(generation, &payload);
                publish(&controller, &status, &history);
            }
            Some((generation, event)) = inbox.session_events.recv() => {
                controller.on_session_event(generation, event);
                publish(&controller, &status, &history);
            }
            Some(unit_id) = inbox.playback_ended.recv() => {
                controller.on_playback_ended(unit_id);
                publish(&controller, &status, &history);
            }
        }
    }

    info!("Bridge task stopped");
}

fn publish(
    controller: &SessionController,
    status: &RwLock<BridgeStatus>,
    history: &RwLock<Vec<ChatMessage>>,
) {
    *status.write().unwrap_or_else(PoisonError::into_inner) = controller.snapshot();

    let mut shared = history.write().unwrap_or_else(PoisonError::into_inner);
    append_new_records(&mut shared, controller.history());
}

/// History only grows, so only the records not yet shared are cloned.
fn append_new_records(shared: &mut Vec<ChatMessage>, records: &[ChatMessage]) {
    if records.len() < shared.len() {
        shared.clear();
    }
    shared.extend_from_slice(&records[shared.len()..]);
}

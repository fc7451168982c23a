//! # Session Lifecycle Controller
//!
//! Owns both links and everything that flows between them:
//!
//! - **Hardware link**: paired microphone, pushing PCM notifications
//! - **AI session**: realtime voice session, pushing transcripts, audio and control events
//! - **Relay / scheduler**: the two audio directions
//! - **Transcript buffers and history**: ghost text for the current turn, finalized records
//!
//! The controller is not shared. The bridge task owns it and feeds it one
//! message at a time, so nothing here takes a lock.
//!
//! ## Generations:
//! Every connect and disconnect bumps `generation`. Notifications and session
//! events are tagged with the generation that was current when their channel was
//! created, so traffic from a torn-down link or a closed session is discarded
//! instead of leaking into the next one.

use crate::audio::codec::decode_remote;
use crate::audio::output::{EndedSender, OutputFactory};
use crate::audio::relay::InboundRelay;
use crate::audio::scheduler::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::BridgeError;
use crate::hardware::{DeviceInfo, HardwareLink, LinkFactory};
use crate::session::{SessionConnector, SessionEvent, SessionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// State of one of the two links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl LinkStatus {
    fn is_busy(self) -> bool {
        matches!(self, LinkStatus::Connecting | LinkStatus::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Ai,
}

/// A finalized transcript record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(sender: Speaker, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text,
            timestamp: Utc::now(),
        }
    }
}

/// Per-turn accumulation of transcript chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranscriptBuffer {
    pub input: String,
    pub output: String,
}

impl TranscriptBuffer {
    /// Turn the current buffers into one user and one AI record and clear them.
    /// Empty buffers still produce records.
    fn finalize(&mut self) -> (ChatMessage, ChatMessage) {
        let user = ChatMessage::new(Speaker::User, std::mem::take(&mut self.input));
        let ai = ChatMessage::new(Speaker::Ai, std::mem::take(&mut self.output));
        (user, ai)
    }

    fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BridgeMetrics {
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub units_scheduled: u64,
    pub units_dropped: u64,
    pub units_active: usize,
    pub interruptions: u64,
    pub turns_completed: u64,
}

/// Everything a front end needs to render the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub hardware: LinkStatus,
    pub ai: LinkStatus,
    pub device: Option<DeviceInfo>,
    pub ai_speaking: bool,
    /// RMS of the last scheduled AI audio unit, for the level meter.
    pub output_level: f32,
    pub status_line: String,
    pub transcript: TranscriptBuffer,
    pub metrics: BridgeMetrics,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            hardware: LinkStatus::Disconnected,
            ai: LinkStatus::Disconnected,
            device: None,
            ai_speaking: false,
            output_level: 0.0,
            status_line: "Disconnected".to_string(),
            transcript: TranscriptBuffer::default(),
            metrics: BridgeMetrics::default(),
        }
    }
}

/// Live stream item pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Status(BridgeStatus),
    InputTranscript { text: String, pending: String },
    OutputTranscript { text: String, pending: String },
    TurnComplete { user: ChatMessage, ai: ChatMessage },
    Interrupted { stopped_units: usize },
    Error { kind: String, message: String },
}

/// Receiving ends the bridge task selects over.
pub struct ControllerInbox {
    pub notifications: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    pub session_events: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
    pub playback_ended: mpsc::UnboundedReceiver<u64>,
}

/// Hand out a sender whose messages arrive on `out` tagged with `generation`.
fn tagged<T: Send + 'static>(generation: u64, out: mpsc::UnboundedSender<(u64, T)>) -> mpsc::UnboundedSender<T> {
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if out.send((generation, item)).is_err() {
                break;
            }
        }
    });
    tx
}

pub struct SessionController {
    hardware: LinkStatus,
    ai: LinkStatus,
    device: Option<DeviceInfo>,
    link: Option<Box<dyn HardwareLink>>,
    session: Option<Box<dyn SessionHandle>>,
    generation: u64,
    output_rate: u32,

    relay: InboundRelay,
    scheduler: PlaybackScheduler,
    transcript: TranscriptBuffer,
    history: Vec<ChatMessage>,
    ai_speaking: bool,
    output_level: f32,
    status_line: String,
    metrics: BridgeMetrics,

    links: LinkFactory,
    connector: Arc<dyn SessionConnector>,
    outputs: OutputFactory,

    notify_tx: mpsc::UnboundedSender<(u64, Vec<u8>)>,
    session_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    ended_tx: EndedSender,
    events: broadcast::Sender<BridgeEvent>,
}

impl SessionController {
    pub fn new(
        links: LinkFactory,
        connector: Arc<dyn SessionConnector>,
        outputs: OutputFactory,
        events: broadcast::Sender<BridgeEvent>,
    ) -> (Self, ControllerInbox) {
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let (session_tx, session_events) = mpsc::unbounded_channel();
        let (ended_tx, playback_ended) = mpsc::unbounded_channel();

        let controller = Self {
            hardware: LinkStatus::Disconnected,
            ai: LinkStatus::Disconnected,
            device: None,
            link: None,
            session: None,
            generation: 0,
            output_rate: 24000,
            relay: InboundRelay::default(),
            scheduler: PlaybackScheduler::new(),
            transcript: TranscriptBuffer::default(),
            history: Vec::new(),
            ai_speaking: false,
            output_level: 0.0,
            status_line: "Disconnected".to_string(),
            metrics: BridgeMetrics::default(),
            links,
            connector,
            outputs,
            notify_tx,
            session_tx,
            ended_tx,
            events,
        };

        let inbox = ControllerInbox {
            notifications,
            session_events,
            playback_ended,
        };
        (controller, inbox)
    }

    /// Pair the hardware, then open the AI session, then start forwarding audio.
    ///
    /// A hardware failure stops the workflow before the AI is attempted. An AI
    /// failure leaves the hardware connected.
    pub async fn connect_all(&mut self, config: &AppConfig) -> Result<(), BridgeError> {
        if self.hardware.is_busy() || self.ai.is_busy() {
            return Err(BridgeError::InvalidState(format!(
                "bridge is already active (hardware {:?}, ai {:?})",
                self.hardware, self.ai
            )));
        }

        self.generation += 1;
        let generation = self.generation;
        self.transcript.clear();
        self.ai_speaking = false;

        // Hardware
        self.hardware = LinkStatus::Connecting;
        self.ai = LinkStatus::Disconnected;
        self.set_status_line(format!("Searching for {}...", config.device.name_prefix));

        let mut link = (self.links)(&config.device);
        match link.connect().await {
            Ok(device) => {
                info!(device_id = %device.id, device_name = %device.name, "Hardware link connected");
                self.set_status_line(format!("Connected to {}. Opening AI session...", device.name));
                self.device = Some(device);
                self.hardware = LinkStatus::Connected;
                self.link = Some(link);
            }
            Err(e) => {
                error!("Hardware link failed: {}", e);
                link.disconnect().await;
                self.hardware = LinkStatus::Error;
                self.report_error(&e, format!("Pairing failed: {}", e));
                return Err(e);
            }
        }

        // AI session
        self.ai = LinkStatus::Connecting;
        self.publish_status();

        self.relay.set_sample_rate(config.session.input_sample_rate);
        self.output_rate = config.session.output_sample_rate;
        match (self.outputs)(&config.playback, self.output_rate, self.ended_tx.clone()) {
            Ok(output) => self.scheduler.attach(output),
            Err(e) => warn!("Playback output unavailable, AI audio will be dropped: {}", e),
        }

        let connector = self.connector.clone();
        let events = tagged(generation, self.session_tx.clone());
        match connector.connect(&config.session, events).await {
            Ok(session) => self.session = Some(session),
            Err(e) => return Err(self.fail_ai_setup(e).await),
        }
        self.ai = LinkStatus::Connected;

        // Audio starts flowing only once there is somewhere to send it
        let notifications = tagged(generation, self.notify_tx.clone());
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.start_notifications(notifications).await {
                return Err(self.fail_ai_setup(e).await);
            }
        }

        let name = self.device.as_ref().map(|d| d.name.clone()).unwrap_or_default();
        info!(generation, "Bridge live");
        self.set_status_line(format!("Live. Listening to {}.", name));
        Ok(())
    }

    async fn fail_ai_setup(&mut self, e: BridgeError) -> BridgeError {
        error!("AI session setup failed: {}", e);
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.scheduler.detach();
        self.ai = LinkStatus::Error;
        self.report_error(&e, format!("AI session failed: {}", e));
        e
    }

    /// Close the AI session, release the output, then drop the hardware link.
    /// Both links end up `Disconnected` whatever state they were in.
    pub async fn disconnect_all(&mut self) {
        self.generation += 1;

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.scheduler.detach();
        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
        }

        self.device = None;
        self.hardware = LinkStatus::Disconnected;
        self.ai = LinkStatus::Disconnected;
        self.ai_speaking = false;
        self.output_level = 0.0;
        self.transcript.clear();
        info!("Bridge disconnected");
        self.set_status_line("Disconnected".to_string());
    }

    /// One microphone notification.
    pub fn on_notification(&mut self, generation: u64, payload: &[u8]) {
        if generation != self.generation {
            return;
        }
        let session = match self.ai {
            LinkStatus::Connected => self.session.as_deref(),
            _ => None,
        };
        self.relay.relay(payload, session);
    }

    /// One event from the AI session.
    pub fn on_session_event(&mut self, generation: u64, event: SessionEvent) {
        if generation != self.generation {
            debug!(generation, current = self.generation, "Ignoring event from a previous session");
            return;
        }

        match event {
            SessionEvent::InputTranscription(text) => {
                self.transcript.input.push_str(&text);
                let pending = self.transcript.input.clone();
                self.emit(BridgeEvent::InputTranscript { text, pending });
            }
            SessionEvent::OutputTranscription(text) => {
                self.transcript.output.push_str(&text);
                self.ai_speaking = true;
                let pending = self.transcript.output.clone();
                self.emit(BridgeEvent::OutputTranscript { text, pending });
            }
            SessionEvent::TurnComplete => {
                let (user, ai) = self.transcript.finalize();
                self.history.push(user.clone());
                self.history.push(ai.clone());
                self.ai_speaking = false;
                self.metrics.turns_completed += 1;
                debug!(user_chars = user.text.len(), ai_chars = ai.text.len(), "Turn complete");
                self.emit(BridgeEvent::TurnComplete { user, ai });
            }
            SessionEvent::Audio(data) => self.play(&data),
            SessionEvent::Interrupted => {
                let stopped_units = self.scheduler.flush();
                self.output_level = 0.0;
                self.metrics.interruptions += 1;
                info!(stopped_units, "Playback interrupted");
                self.emit(BridgeEvent::Interrupted { stopped_units });
            }
            SessionEvent::Error(message) => {
                error!("AI session transport error: {}", message);
                self.ai = LinkStatus::Error;
                let e = BridgeError::Transport(message);
                self.report_error(&e, format!("AI session error: {}", e));
            }
            SessionEvent::Closed => {
                info!("AI session closed by remote");
                self.session = None;
                self.scheduler.flush();
                self.ai_speaking = false;
                self.output_level = 0.0;
                // a close that follows a transport error keeps the error visible
                if self.ai != LinkStatus::Error {
                    self.ai = LinkStatus::Disconnected;
                    self.set_status_line("AI session closed".to_string());
                } else {
                    self.publish_status();
                }
            }
        }
    }

    fn play(&mut self, data: &str) {
        let scheduled = decode_remote(data, self.output_rate, 1).and_then(|buffer| {
            let level = buffer.rms();
            self.scheduler.schedule(buffer)?;
            self.output_level = level;
            Ok(())
        });
        match scheduled {
            Ok(_) => self.metrics.units_scheduled += 1,
            Err(e) => {
                debug!("Dropping AI audio: {}", e);
                self.metrics.units_dropped += 1;
            }
        }
    }

    /// A playback unit finished on its own.
    pub fn on_playback_ended(&mut self, unit_id: u64) {
        self.scheduler.on_ended(unit_id);
    }

    pub fn snapshot(&self) -> BridgeStatus {
        let mut metrics = self.metrics.clone();
        metrics.frames_forwarded = self.relay.forwarded();
        metrics.frames_dropped = self.relay.dropped();
        metrics.units_active = self.scheduler.active_count();

        BridgeStatus {
            hardware: self.hardware,
            ai: self.ai,
            device: self.device.clone(),
            ai_speaking: self.ai_speaking,
            output_level: self.output_level,
            status_line: self.status_line.clone(),
            transcript: self.transcript.clone(),
            metrics,
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn set_status_line(&mut self, line: String) {
        self.status_line = line;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.emit(BridgeEvent::Status(self.snapshot()));
    }

    fn report_error(&mut self, e: &BridgeError, line: String) {
        self.emit(BridgeEvent::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        });
        self.set_status_line(line);
    }

    fn emit(&self, event: BridgeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::AudioOutput;
    use crate::audio::scheduler::tests::{ManualOutput, ManualState};
    use crate::config::PlaybackConfig;
    use crate::hardware::tests::{scripted_factory, ScriptState};
    use crate::session::tests::FakeConnector;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    struct Harness {
        controller: SessionController,
        inbox: ControllerInbox,
        link: Arc<Mutex<ScriptState>>,
        connector: Arc<FakeConnector>,
        output: Arc<Mutex<ManualState>>,
        events: broadcast::Receiver<BridgeEvent>,
    }

    fn harness_with(connector: FakeConnector, link: ScriptState) -> Harness {
        let link = Arc::new(Mutex::new(link));
        let connector = Arc::new(connector);
        let output = Arc::new(Mutex::new(ManualState::default()));
        let factory_output = output.clone();
        let outputs: OutputFactory = Arc::new(move |_config: &PlaybackConfig, _rate, _ended| -> Result<Box<dyn AudioOutput>, BridgeError> {
            Ok(Box::new(ManualOutput(factory_output.clone())))
        });
        let (events_tx, events) = broadcast::channel(256);
        let (controller, inbox) =
            SessionController::new(scripted_factory(link.clone()), connector.clone(), outputs, events_tx);
        Harness {
            controller,
            inbox,
            link,
            connector,
            output,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeConnector::default(), ScriptState::default())
    }

    /// 100 ms of 24 kHz mono silence, base64 encoded.
    fn remote_chunk() -> String {
        STANDARD.encode(vec![0u8; 4800])
    }

    fn drain(events: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_all_brings_both_links_up() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();

        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Connected);
        assert_eq!(status.ai, LinkStatus::Connected);
        assert_eq!(status.device.unwrap().name, "XIAO Sense");
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
        assert!(h.link.lock().unwrap().notifications.is_some());
    }

    #[tokio::test]
    async fn test_hardware_failure_never_attempts_ai() {
        let mut h = harness_with(
            FakeConnector::default(),
            ScriptState {
                connect_error: Some(BridgeError::PairingFailed("user cancelled".to_string())),
                ..Default::default()
            },
        );

        let err = h.controller.connect_all(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::PairingFailed(_)));

        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Error);
        assert_eq!(status.ai, LinkStatus::Disconnected);
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, BridgeEvent::Error { kind, .. } if kind == "pairing_failed")));
    }

    #[tokio::test]
    async fn test_ai_failure_keeps_hardware_connected() {
        let mut h = harness_with(
            FakeConnector {
                fail: true,
                ..Default::default()
            },
            ScriptState::default(),
        );

        let err = h.controller.connect_all(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionHandshakeFailed(_)));

        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Connected);
        assert_eq!(status.ai, LinkStatus::Error);
        assert_eq!(h.link.lock().unwrap().disconnects, 0);
        assert!(h.output.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_notification_failure_is_an_ai_failure() {
        let mut h = harness_with(
            FakeConnector::default(),
            ScriptState {
                notify_error: Some(BridgeError::ServiceOrCharacteristicMissing("no audio char".to_string())),
                ..Default::default()
            },
        );

        assert!(h.controller.connect_all(&AppConfig::default()).await.is_err());
        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Connected);
        assert_eq!(status.ai, LinkStatus::Error);
        assert!(*h.connector.session.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();

        let err = h.controller.connect_all(&AppConfig::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState(_)));
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.snapshot().ai, LinkStatus::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_resets_everything() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let generation = h.controller.generation;
        h.controller.on_session_event(generation, SessionEvent::Audio(remote_chunk()));

        h.controller.disconnect_all().await;

        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Disconnected);
        assert_eq!(status.ai, LinkStatus::Disconnected);
        assert!(status.device.is_none());
        assert_eq!(status.metrics.units_active, 0);
        assert!(*h.connector.session.closed.lock().unwrap());
        assert!(h.output.lock().unwrap().closed);
        assert_eq!(h.link.lock().unwrap().disconnects, 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_error_states() {
        let mut h = harness_with(
            FakeConnector {
                fail: true,
                ..Default::default()
            },
            ScriptState::default(),
        );
        let _ = h.controller.connect_all(&AppConfig::default()).await;
        h.controller.disconnect_all().await;

        let status = h.controller.snapshot();
        assert_eq!(status.hardware, LinkStatus::Disconnected);
        assert_eq!(status.ai, LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_notifications_flow_through_the_inbox() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();

        let sender = h.link.lock().unwrap().notifications.clone().unwrap();
        sender.send(vec![0u8; 320]).unwrap();
        sender.send(vec![1u8; 320]).unwrap();

        for _ in 0..2 {
            let (generation, payload) = h.inbox.notifications.recv().await.unwrap();
            h.controller.on_notification(generation, &payload);
        }

        let sent = h.connector.session.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].data, STANDARD.encode(vec![1u8; 320]));
        assert_eq!(h.controller.snapshot().metrics.frames_forwarded, 2);
    }

    #[tokio::test]
    async fn test_transcripts_and_turn_complete() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;
        drain(&mut h.events);

        h.controller.on_session_event(g, SessionEvent::InputTranscription("Hello ".to_string()));
        h.controller.on_session_event(g, SessionEvent::InputTranscription("there".to_string()));
        h.controller.on_session_event(g, SessionEvent::OutputTranscription("Hi!".to_string()));
        assert!(h.controller.snapshot().ai_speaking);
        assert_eq!(h.controller.snapshot().transcript.input, "Hello there");

        h.controller.on_session_event(g, SessionEvent::TurnComplete);

        let status = h.controller.snapshot();
        assert!(!status.ai_speaking);
        assert_eq!(status.transcript, TranscriptBuffer::default());
        assert_eq!(status.metrics.turns_completed, 1);

        let history = h.controller.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender, Speaker::User);
        assert_eq!(history[0].text, "Hello there");
        assert_eq!(history[1].sender, Speaker::Ai);
        assert_eq!(history[1].text, "Hi!");

        let events = drain(&mut h.events);
        assert!(matches!(&events[1], BridgeEvent::InputTranscript { pending, .. } if pending == "Hello there"));
        assert!(matches!(events.last(), Some(BridgeEvent::TurnComplete { .. })));
    }

    #[tokio::test]
    async fn test_turn_complete_with_empty_buffers_still_records() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;

        h.controller.on_session_event(g, SessionEvent::TurnComplete);

        let history = h.controller.history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.text.is_empty()));
        assert_ne!(history[0].id, history[1].id);
    }

    #[tokio::test]
    async fn test_interruption_flushes_three_units() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;

        for _ in 0..3 {
            h.controller.on_session_event(g, SessionEvent::Audio(remote_chunk()));
        }
        assert_eq!(h.controller.snapshot().metrics.units_active, 3);

        h.output.lock().unwrap().now = 0.05;
        h.controller.on_session_event(g, SessionEvent::Interrupted);

        {
            let output = h.output.lock().unwrap();
            assert_eq!(output.stopped.len(), 3);
        }
        assert_eq!(h.controller.snapshot().metrics.units_active, 0);
        assert_eq!(h.controller.snapshot().metrics.interruptions, 1);
        assert_eq!(h.controller.snapshot().output_level, 0.0);

        h.controller.on_session_event(g, SessionEvent::Audio(remote_chunk()));
        let output = h.output.lock().unwrap();
        let (_, start) = output.started.last().copied().unwrap();
        assert!((start - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transport_error_leaves_hardware_alone() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;

        h.controller.on_session_event(g, SessionEvent::Error("connection reset".to_string()));

        let status = h.controller.snapshot();
        assert_eq!(status.ai, LinkStatus::Error);
        assert_eq!(status.hardware, LinkStatus::Connected);

        // frames keep arriving and are dropped
        h.controller.on_notification(g, &[0u8; 320]);
        assert!(h.connector.session.sent.lock().unwrap().is_empty());
        assert_eq!(h.controller.snapshot().metrics.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_remote_close_flushes_playback() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;
        h.controller.on_session_event(g, SessionEvent::Audio(remote_chunk()));

        h.controller.on_session_event(g, SessionEvent::Closed);

        let status = h.controller.snapshot();
        assert_eq!(status.ai, LinkStatus::Disconnected);
        assert_eq!(status.hardware, LinkStatus::Connected);
        assert_eq!(status.metrics.units_active, 0);
    }

    #[tokio::test]
    async fn test_close_after_transport_error_keeps_error() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;
        h.controller.on_session_event(g, SessionEvent::Audio(remote_chunk()));

        h.controller.on_session_event(g, SessionEvent::Error("write failed: broken pipe".to_string()));
        h.controller.on_session_event(g, SessionEvent::Closed);

        let status = h.controller.snapshot();
        assert_eq!(status.ai, LinkStatus::Error);
        assert_eq!(status.hardware, LinkStatus::Connected);
        assert_eq!(status.metrics.units_active, 0);
        assert!(status.status_line.starts_with("AI session error"));
        assert!(h.controller.session.is_none());
    }

    #[tokio::test]
    async fn test_input_rate_comes_from_config() {
        let mut h = harness();
        let mut config = AppConfig::default();
        config.session.input_sample_rate = 8000;
        h.controller.connect_all(&config).await.unwrap();
        let g = h.controller.generation;

        h.controller.on_notification(g, &[0u8; 320]);

        let sent = h.connector.session.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=8000");
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let stale = h.controller.generation - 1;

        h.controller.on_session_event(stale, SessionEvent::InputTranscription("ghost".to_string()));
        h.controller.on_notification(stale, &[0u8; 320]);

        assert!(h.controller.snapshot().transcript.input.is_empty());
        assert!(h.connector.session.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_remote_audio_is_dropped() {
        let mut h = harness();
        h.controller.connect_all(&AppConfig::default()).await.unwrap();
        let g = h.controller.generation;

        h.controller.on_session_event(g, SessionEvent::Audio("***".to_string()));
        let metrics = h.controller.snapshot().metrics;
        assert_eq!(metrics.units_dropped, 1);
        assert_eq!(metrics.units_scheduled, 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(BridgeEvent::Status(BridgeStatus::default())).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["hardware"], "DISCONNECTED");

        let json = serde_json::to_value(BridgeEvent::Interrupted { stopped_units: 2 }).unwrap();
        assert_eq!(json["type"], "interrupted");
        assert_eq!(json["stopped_units"], 2);

        let message = ChatMessage::new(Speaker::Ai, "ok".to_string());
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["sender"], "ai");
    }
}

//! # Realtime Voice Session
//!
//! The cloud session is treated as a capability, not a concrete SDK type:
//!
//! - [`SessionConnector`] opens a session and wires its inbound traffic to an
//!   event channel.
//! - [`SessionHandle`] is what the rest of the bridge holds afterwards: it can
//!   send microphone audio and close the session. Nothing else.
//!
//! Any provider that can satisfy these two traits can replace the Gemini adapter.

pub mod gemini;
pub mod protocol;

use crate::config::SessionConfig;
use crate::error::BridgeError;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use gemini::GeminiConnector;

/// MIME descriptor declared for microphone audio (16-bit PCM, mono implied).
pub fn input_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// One chunk of microphone audio ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    /// Base64 of raw little-endian PCM bytes
    pub data: String,
    pub mime_type: String,
}

/// Inbound traffic from the session, in the order the provider reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Partial transcript of what the user said
    InputTranscription(String),
    /// Partial transcript of what the AI is saying
    OutputTranscription(String),
    /// The current conversational turn is finished
    TurnComplete,
    /// Inline base64 PCM to play (24 kHz mono for Gemini)
    Audio(String),
    /// The user spoke over the AI; queued playback must stop
    Interrupted,
    /// Terminal transport failure
    Error(String),
    /// The remote side closed the session
    Closed,
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// A live session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Queue one chunk of microphone audio. Never blocks on the network.
    fn send_audio(&self, audio: EncodedAudio) -> Result<(), BridgeError>;

    /// Close the session and wait for the transport to shut down.
    async fn close(&self);
}

/// Opens sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Perform the handshake. Returns once the provider has accepted the setup;
    /// from then on inbound traffic is delivered on `events`.
    async fn connect(
        &self,
        config: &SessionConfig,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionHandle>, BridgeError>;
}

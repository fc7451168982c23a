//! Forwards microphone notifications to the live session.
//!
//! Frames that arrive before a session exists, after it has failed, or that do
//! not decode are dropped on the spot. Nothing is buffered.

use crate::audio::codec::{decode_inbound, encode_outbound, INBOUND_SAMPLE_RATE};
use crate::session::{input_mime_type, EncodedAudio, SessionHandle};
use tracing::{debug, warn};

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Forwarded,
    Dropped,
}

pub struct InboundRelay {
    mime_type: String,
    forwarded: u64,
    dropped: u64,
}

impl Default for InboundRelay {
    fn default() -> Self {
        Self::new(INBOUND_SAMPLE_RATE)
    }
}

impl InboundRelay {
    /// `sample_rate` is the rate declared to the session in the mime type.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            mime_type: input_mime_type(sample_rate),
            forwarded: 0,
            dropped: 0,
        }
    }

    /// Counters survive a rate change; only the declared format moves.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.mime_type = input_mime_type(sample_rate);
    }

    /// Relay one payload. `session` is `None` whenever no usable session exists.
    pub fn relay(&mut self, payload: &[u8], session: Option<&dyn SessionHandle>) -> RelayOutcome {
        let Some(session) = session else {
            self.dropped += 1;
            return RelayOutcome::Dropped;
        };

        let frame = match decode_inbound(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(bytes = payload.len(), "Dropping microphone frame: {}", e);
                self.dropped += 1;
                return RelayOutcome::Dropped;
            }
        };

        let audio = EncodedAudio {
            data: encode_outbound(&frame),
            mime_type: self.mime_type.clone(),
        };

        match session.send_audio(audio) {
            Ok(()) => {
                self.forwarded += 1;
                RelayOutcome::Forwarded
            }
            Err(e) => {
                debug!("Session refused microphone frame: {}", e);
                self.dropped += 1;
                RelayOutcome::Dropped
            }
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{RecordingSession, SharedSession};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::sync::Arc;

    fn notification(seed: u8) -> Vec<u8> {
        (0..320u16).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_frames_without_session_are_dropped() {
        let mut relay = InboundRelay::default();
        assert_eq!(relay.relay(&notification(0), None), RelayOutcome::Dropped);
        assert_eq!(relay.relay(&notification(1), None), RelayOutcome::Dropped);
        assert_eq!(relay.dropped(), 2);
        assert_eq!(relay.forwarded(), 0);
    }

    #[test]
    fn test_frames_with_session_are_forwarded_in_order() {
        let recorder = Arc::new(RecordingSession::default());
        let session = SharedSession(recorder.clone());
        let mut relay = InboundRelay::default();

        let first = notification(0);
        let second = notification(7);
        assert_eq!(relay.relay(&first, Some(&session)), RelayOutcome::Forwarded);
        assert_eq!(relay.relay(&second, Some(&session)), RelayOutcome::Forwarded);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data, STANDARD.encode(&first));
        assert_eq!(sent[1].data, STANDARD.encode(&second));
        assert!(sent.iter().all(|a| a.mime_type == "audio/pcm;rate=16000"));
        assert_eq!(relay.forwarded(), 2);
    }

    #[test]
    fn test_declared_rate_follows_configuration() {
        let recorder = Arc::new(RecordingSession::default());
        let session = SharedSession(recorder.clone());
        let mut relay = InboundRelay::new(8000);
        relay.relay(&notification(0), Some(&session));
        relay.set_sample_rate(16000);
        relay.relay(&notification(1), Some(&session));

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].mime_type, "audio/pcm;rate=8000");
        assert_eq!(sent[1].mime_type, "audio/pcm;rate=16000");
        assert_eq!(relay.forwarded(), 2);
    }

    #[test]
    fn test_odd_payload_and_failed_send_are_dropped() {
        let recorder = Arc::new(RecordingSession::default());
        let session = SharedSession(recorder.clone());
        let mut relay = InboundRelay::default();
        assert_eq!(relay.relay(&[1, 2, 3], Some(&session)), RelayOutcome::Dropped);
        assert!(recorder.sent.lock().unwrap().is_empty());

        let broken = SharedSession(Arc::new(RecordingSession {
            fail_sends: true,
            ..Default::default()
        }));
        assert_eq!(relay.relay(&notification(0), Some(&broken)), RelayOutcome::Dropped);
        assert_eq!(relay.dropped(), 2);
    }
}

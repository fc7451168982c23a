//! # Audio Pipeline
//!
//! Both directions of the bridge's audio path.
//!
//! ## Key Components:
//! - **Codec**: notification bytes <-> `AudioFrame` <-> base64, base64 -> `PcmBuffer`
//! - **Relay**: microphone notifications to the live session, dropped when there is none
//! - **Scheduler**: gapless, strictly ordered playback of AI audio on one clock
//! - **Output**: the playback device capability (headless timers or a real speaker)
//!
//! ## Audio Formats:
//! - **Microphone**: 16 kHz, 16-bit LE PCM, mono
//! - **AI speech**: 24 kHz, 16-bit LE PCM, mono, base64 in transit

pub mod codec;
pub mod output;
pub mod relay;
pub mod scheduler;

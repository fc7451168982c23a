//! # PCM Frame Codec
//!
//! Converts audio between the three shapes the bridge deals with:
//!
//! - **Notification bytes**: raw little-endian 16-bit PCM as sent by the microphone
//! - **AudioFrame**: interleaved `i16` samples tagged with channel count and rate
//! - **PcmBuffer**: planar `f32` channels ready for playback
//!
//! Base64 is the transport encoding on the session side in both directions.

use crate::error::BridgeError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};

/// Sample rate of the microphone stream (producer-defined, not negotiated).
pub const INBOUND_SAMPLE_RATE: u32 = 16000;

/// Channel count of the microphone stream.
pub const INBOUND_CHANNELS: u16 = 1;

/// Interleaved signed 16-bit PCM.
///
/// ## Invariant:
/// `samples.len()` is a multiple of `channels`, which matches the byte-level rule
/// that an encoded frame is a whole multiple of `2 * channels` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Build a frame, checking the sample count against the channel layout.
    pub fn new(samples: Vec<i16>, channels: u16, sample_rate: u32) -> Result<Self, BridgeError> {
        if channels == 0 {
            return Err(BridgeError::Decode("channel count must be at least 1".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(BridgeError::Decode(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Encoded size in bytes.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }
}

/// Planar floating-point audio, one `Vec<f32>` per channel, all the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Root-mean-square level over all channels, in [0.0, 1.0]. Drives the level meter.
    pub fn rms(&self) -> f32 {
        let count: usize = self.channels.iter().map(|c| c.len()).sum();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .channels
            .iter()
            .flat_map(|c| c.iter())
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        (sum / count as f64).sqrt() as f32
    }
}

/// Decode a notification payload from the microphone.
///
/// The payload is raw little-endian 16-bit mono PCM at 16 kHz. No resampling is done.
/// An odd byte count is a decode error; an empty payload is an empty frame.
pub fn decode_inbound(bytes: &[u8]) -> Result<AudioFrame, BridgeError> {
    if bytes.len() % 2 != 0 {
        return Err(BridgeError::Decode(format!(
            "notification length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);

    AudioFrame::new(samples, INBOUND_CHANNELS, INBOUND_SAMPLE_RATE)
}

/// Encode a frame as base64 of its little-endian PCM bytes.
///
/// Exact inverse of [`decode_inbound`] followed by base64, so re-encoding a decoded
/// notification yields the base64 of the original payload bit for bit.
pub fn encode_outbound(frame: &AudioFrame) -> String {
    let mut bytes = vec![0u8; frame.byte_len()];
    LittleEndian::write_i16_into(&frame.samples, &mut bytes);
    BASE64.encode(bytes)
}

/// Decode a base64 audio payload received from the session into planar floats.
///
/// ## Conversion:
/// - base64 text -> raw bytes -> interleaved little-endian `i16`
/// - de-interleave by `channels`
/// - each sample divided by 32768.0, so every value lands in [-1.0, 1.0)
///
/// Frames per channel are `total_samples / channels`; trailing samples that do not
/// fill a whole frame are discarded.
pub fn decode_remote(base64_text: &str, sample_rate: u32, channels: u16) -> Result<PcmBuffer, BridgeError> {
    if channels == 0 {
        return Err(BridgeError::Decode("channel count must be at least 1".to_string()));
    }

    let bytes = BASE64
        .decode(base64_text.trim())
        .map_err(|e| BridgeError::Decode(format!("invalid base64 audio: {}", e)))?;

    if bytes.len() % 2 != 0 {
        return Err(BridgeError::Decode(format!(
            "remote audio length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes, &mut samples);

    let channel_count = channels as usize;
    let frame_count = samples.len() / channel_count;

    let planar = (0..channel_count)
        .map(|channel| {
            (0..frame_count)
                .map(|i| samples[i * channel_count + channel] as f32 / 32768.0)
                .collect::<Vec<f32>>()
        })
        .collect();

    Ok(PcmBuffer {
        channels: planar,
        sample_rate,
    })
}

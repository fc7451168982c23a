//! Replays a recording as if it came from the microphone peripheral.
//!
//! Accepts a 16 kHz mono 16-bit WAV file, or any other file taken as raw
//! little-endian PCM. Payloads are sent at real-time pace in chunks of
//! `replay_chunk_bytes`, like the firmware's notifications.

use crate::audio::codec::{INBOUND_CHANNELS, INBOUND_SAMPLE_RATE};
use crate::config::DeviceConfig;
use crate::error::BridgeError;
use crate::hardware::{DeviceInfo, HardwareLink, NotificationSender};
use async_trait::async_trait;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info};

pub struct ReplayLink {
    path: PathBuf,
    chunk_bytes: usize,
    fallback_name: String,
    pcm: Vec<u8>,
    pump: Option<JoinHandle<()>>,
}

impl ReplayLink {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            path: PathBuf::from(config.replay_file.trim()),
            chunk_bytes: config.replay_chunk_bytes.max(2),
            fallback_name: config.fallback_name.clone(),
            pcm: Vec::new(),
            pump: None,
        }
    }

    /// Time one chunk takes to play at the microphone rate.
    fn chunk_interval(&self) -> Duration {
        let samples = (self.chunk_bytes / 2) as f64;
        Duration::from_secs_f64(samples / INBOUND_SAMPLE_RATE as f64)
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Pull the PCM bytes out of a WAV file, insisting on the microphone's format.
fn wav_to_pcm(bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
    let (header, data) = wav::read(&mut Cursor::new(bytes))
        .map_err(|e| BridgeError::ServiceOrCharacteristicMissing(format!("unreadable WAV: {}", e)))?;

    if header.sampling_rate != INBOUND_SAMPLE_RATE || header.channel_count != INBOUND_CHANNELS {
        return Err(BridgeError::ServiceOrCharacteristicMissing(format!(
            "recording is {} Hz / {} ch, expected {} Hz mono",
            header.sampling_rate, header.channel_count, INBOUND_SAMPLE_RATE
        )));
    }

    let samples = data.try_into_sixteen().map_err(|_| {
        BridgeError::ServiceOrCharacteristicMissing("recording is not 16-bit PCM".to_string())
    })?;

    Ok(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
}

#[async_trait]
impl HardwareLink for ReplayLink {
    async fn connect(&mut self) -> Result<DeviceInfo, BridgeError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            BridgeError::PairingFailed(format!("replay source {} not available: {}", self.path.display(), e))
        })?;

        self.pcm = if is_wav(&self.path) { wav_to_pcm(&bytes)? } else { bytes };

        let name = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.fallback_name.clone());

        info!(
            path = %self.path.display(),
            bytes = self.pcm.len(),
            "Replay device connected"
        );

        Ok(DeviceInfo {
            id: format!("replay:{}", self.path.display()),
            name,
        })
    }

    async fn start_notifications(&mut self, notifications: NotificationSender) -> Result<(), BridgeError> {
        if self.pcm.is_empty() {
            return Err(BridgeError::ServiceOrCharacteristicMissing(
                "replay source has no audio".to_string(),
            ));
        }

        let pcm = std::mem::take(&mut self.pcm);
        let chunk_bytes = self.chunk_bytes;
        let mut ticker = time::interval(self.chunk_interval());

        self.pump = Some(tokio::spawn(async move {
            let mut sent = 0usize;
            for chunk in pcm.chunks(chunk_bytes) {
                ticker.tick().await;
                if notifications.send(chunk.to_vec()).is_err() {
                    break;
                }
                sent += 1;
            }
            debug!(chunks = sent, "Replay finished");
        }));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.pcm.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("voice-bridge-{}-{}", uuid::Uuid::new_v4(), name))
    }

    fn replay_config(path: &Path) -> DeviceConfig {
        let mut config = crate::config::AppConfig::default().device;
        config.replay_file = path.display().to_string();
        config
    }

    #[tokio::test]
    async fn test_raw_replay_streams_in_chunks() {
        let path = temp_path("mic.raw");
        let pcm: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &pcm).unwrap();

        let mut link = ReplayLink::new(&replay_config(&path));
        let device = link.connect().await.unwrap();
        assert!(device.id.starts_with("replay:"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        link.start_notifications(tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.len(), 320);
        assert_eq!([first, second].concat(), pcm);
        assert!(rx.recv().await.is_none());

        link.disconnect().await;
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_wav_replay_checks_format() {
        let path = temp_path("mic.wav");
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, 16000, 16);
        let samples = wav::BitDepth::Sixteen(vec![1i16, -1, 300, -300]);
        let mut out = std::fs::File::create(&path).unwrap();
        wav::write(header, &samples, &mut out).unwrap();
        drop(out);

        let mut link = ReplayLink::new(&replay_config(&path));
        link.connect().await.unwrap();
        assert_eq!(link.pcm, vec![1, 0, 255, 255, 44, 1, 212, 254]);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_wrong_wav_format_is_rejected() {
        let path = temp_path("stereo.wav");
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 2, 44100, 16);
        let samples = wav::BitDepth::Sixteen(vec![0i16; 8]);
        let mut out = std::fs::File::create(&path).unwrap();
        wav::write(header, &samples, &mut out).unwrap();
        drop(out);

        let mut link = ReplayLink::new(&replay_config(&path));
        assert!(matches!(
            link.connect().await,
            Err(BridgeError::ServiceOrCharacteristicMissing(_))
        ));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_pairing_failure() {
        let mut link = ReplayLink::new(&replay_config(Path::new("/definitely/not/here.raw")));
        assert!(matches!(link.connect().await, Err(BridgeError::PairingFailed(_))));
    }
}

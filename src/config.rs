//! # Configuration Management
//!
//! Loads the bridge configuration from several sources, highest priority first:
//!
//! 1. Special environment variables (`HOST`, `PORT`, `GEMINI_API_KEY`, `API_KEY`)
//! 2. Prefixed environment variables (`APP_SESSION__MODEL`, `APP_DEVICE__NAME_PREFIX`, ...)
//! 3. An optional `config.toml` next to the binary
//! 4. Built-in defaults (the `Default` impl below)
//!
//! ## Sections:
//! - **server**: where the control API listens
//! - **device**: how the Bluetooth peripheral is found (or which file replays it)
//! - **session**: the realtime voice session (endpoint, model, voice, prompt)
//! - **playback**: how AI replies are played back locally

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// GATT service advertised by the microphone firmware.
pub const AUDIO_SERVICE_UUID: &str = "19b10000-e8f2-537e-4f6c-d104768a1214";

/// Notification characteristic carrying raw PCM chunks.
pub const AUDIO_CHAR_UUID: &str = "19b10001-e8f2-537e-4f6c-d104768a1214";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub session: SessionConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Hardware discovery settings.
///
/// ## Fields:
/// - `name_prefix`: only peripherals whose advertised name starts with this are considered
/// - `service_uuid` / `characteristic_uuid`: the audio GATT service and its notify characteristic
/// - `fallback_name`: reported device name when the peripheral advertises none
/// - `scan_timeout_secs`: how long a scan may run before pairing is reported as failed
/// - `replay_file`: when non-empty, a WAV or raw PCM file streamed instead of real hardware
/// - `replay_chunk_bytes`: notification payload size used when replaying (320 bytes = 10 ms)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name_prefix: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub fallback_name: String,
    pub scan_timeout_secs: u64,
    pub replay_file: String,
    pub replay_chunk_bytes: usize,
}

/// Realtime voice session settings.
///
/// `input_sample_rate` is what the microphone produces and what is declared to the
/// session; `output_sample_rate` is the rate of the audio the session sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

/// Local playback settings.
///
/// - `backend`: `"headless"` (silent, wall-clock paced) or `"speaker"` (needs the `speaker` feature)
/// - `gain`: linear output gain applied by the speaker backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub backend: String,
    pub gain: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            device: DeviceConfig {
                name_prefix: "XIAO".to_string(),
                service_uuid: AUDIO_SERVICE_UUID.to_string(),
                characteristic_uuid: AUDIO_CHAR_UUID.to_string(),
                fallback_name: "XIAO ESP32".to_string(),
                scan_timeout_secs: 10,
                replay_file: String::new(),
                replay_chunk_bytes: 320,
            },
            session: SessionConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
                voice: "Puck".to_string(),
                system_instruction: "You are a voice assistant connected via a hardware bridge. \
                    Be concise, friendly, and direct. You are talking to someone through an ESP32 device."
                    .to_string(),
                input_sample_rate: 16000,
                output_sample_rate: 24000,
            },
            playback: PlaybackConfig {
                backend: "headless".to_string(),
                gain: 1.0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_DEVICE__REPLAY_FILE=./fixtures/hello.wav`
    /// - `APP_PLAYBACK__BACKEND=speaker`
    /// - `GEMINI_API_KEY=...` (or `API_KEY=...`)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // GEMINI_API_KEY wins over the generic API_KEY
        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("session.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    ///
    /// A missing API key is not an error here: the service still starts and
    /// reports the handshake failure when a connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.device.service_uuid.trim().is_empty() || self.device.characteristic_uuid.trim().is_empty() {
            return Err(anyhow::anyhow!("Device service and characteristic UUIDs are required"));
        }

        if self.device.replay_chunk_bytes == 0 || self.device.replay_chunk_bytes % 2 != 0 {
            return Err(anyhow::anyhow!("Replay chunk size must be a positive even number of bytes"));
        }

        if self.session.input_sample_rate == 0 || self.session.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Session sample rates must be greater than 0"));
        }

        if self.session.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Session endpoint cannot be empty"));
        }

        match self.playback.backend.as_str() {
            "headless" | "speaker" => {}
            other => return Err(anyhow::anyhow!("Unknown playback backend: {}", other)),
        }

        if !(0.0..=4.0).contains(&self.playback.gain) {
            return Err(anyhow::anyhow!("Playback gain must be between 0.0 and 4.0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the fields present in the JSON are touched, e.g.
    /// `{"session": {"voice": "Kore"}}` changes just the voice. Server host and port
    /// are ignored at runtime since the listener is already bound. Changes apply to
    /// the next `connect`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(device) = partial.get("device") {
            if let Some(prefix) = device.get("name_prefix").and_then(|v| v.as_str()) {
                self.device.name_prefix = prefix.to_string();
            }
            if let Some(timeout) = device.get("scan_timeout_secs").and_then(|v| v.as_u64()) {
                self.device.scan_timeout_secs = timeout;
            }
            if let Some(file) = device.get("replay_file").and_then(|v| v.as_str()) {
                self.device.replay_file = file.to_string();
            }
            if let Some(chunk) = device.get("replay_chunk_bytes").and_then(|v| v.as_u64()) {
                self.device.replay_chunk_bytes = chunk as usize;
            }
        }

        if let Some(session) = partial.get("session") {
            if let Some(model) = session.get("model").and_then(|v| v.as_str()) {
                self.session.model = model.to_string();
            }
            if let Some(voice) = session.get("voice").and_then(|v| v.as_str()) {
                self.session.voice = voice.to_string();
            }
            if let Some(instruction) = session.get("system_instruction").and_then(|v| v.as_str()) {
                self.session.system_instruction = instruction.to_string();
            }
        }

        if let Some(playback) = partial.get("playback") {
            if let Some(backend) = playback.get("backend").and_then(|v| v.as_str()) {
                self.playback.backend = backend.to_string();
            }
            if let Some(gain) = playback.get("gain").and_then(|v| v.as_f64()) {
                self.playback.gain = gain as f32;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Copy of the configuration that is safe to return over HTTP.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if !copy.session.api_key.is_empty() {
            copy.session.api_key = "********".to_string();
        }
        copy
    }
}

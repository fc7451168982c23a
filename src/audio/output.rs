//! # Audio Outputs
//!
//! An output is two things at once: a clock (`now()`, in seconds since the output
//! was opened) and a place to start buffers at a given time on that clock. The
//! playback scheduler only ever talks to the [`AudioOutput`] trait.
//!
//! ## Backends:
//! - **HeadlessOutput**: silent, paced by the tokio clock. Always available and
//!   the default, so the bridge runs on machines without a sound card.
//! - **SpeakerOutput** (`speaker` feature): mixes scheduled buffers into the
//!   default cpal output device.
//!
//! Natural completion of a unit is reported by sending its id on the `ended`
//! channel handed to the backend when it is opened.

use crate::audio::codec::PcmBuffer;
use crate::config::PlaybackConfig;
use crate::error::BridgeError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

/// Sender used by outputs to report that a unit finished playing on its own.
pub type EndedSender = mpsc::UnboundedSender<u64>;

/// Playback capability consumed by the scheduler.
pub trait AudioOutput: Send {
    /// Current output-clock time in seconds.
    fn now(&self) -> f64;

    /// Start `buffer` at output time `at` (seconds). The unit is reported on the
    /// ended channel once it has played out, unless it was stopped first.
    fn start(&mut self, unit_id: u64, buffer: PcmBuffer, at: f64) -> Result<(), BridgeError>;

    /// Stop a unit immediately. Stopping an unknown or finished unit is a no-op.
    fn stop(&mut self, unit_id: u64);

    /// Release the device. Every later `start` fails.
    fn close(&mut self);
}

/// Opens an output at a given sample rate, for the playback configuration current
/// at connect time. Injected into the controller so tests can substitute a manual clock.
pub type OutputFactory =
    Arc<dyn Fn(&PlaybackConfig, u32, EndedSender) -> Result<Box<dyn AudioOutput>, BridgeError> + Send + Sync>;

/// Factory picking the backend named in the configuration.
pub fn default_output_factory() -> OutputFactory {
    Arc::new(
        |config: &PlaybackConfig, sample_rate: u32, ended: EndedSender| -> Result<Box<dyn AudioOutput>, BridgeError> {
            match config.backend.as_str() {
                "headless" => Ok(Box::new(HeadlessOutput::new(sample_rate, ended))),
                #[cfg(feature = "speaker")]
                "speaker" => Ok(Box::new(speaker::SpeakerOutput::open(sample_rate, config.gain, ended)?)),
                other => Err(BridgeError::OutputUnavailable(format!(
                    "playback backend '{}' is not compiled in",
                    other
                ))),
            }
        },
    )
}

/// Silent output driven by the tokio clock.
///
/// Each started unit gets a timer task that fires at `at + duration`; stopping a
/// unit aborts its timer so it never reports completion.
pub struct HeadlessOutput {
    origin: Instant,
    sample_rate: u32,
    ended: EndedSender,
    timers: HashMap<u64, JoinHandle<()>>,
    closed: bool,
}

impl HeadlessOutput {
    pub fn new(sample_rate: u32, ended: EndedSender) -> Self {
        info!(sample_rate, "Opened headless audio output");
        Self {
            origin: Instant::now(),
            sample_rate,
            ended,
            timers: HashMap::new(),
            closed: false,
        }
    }
}

impl AudioOutput for HeadlessOutput {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, unit_id: u64, buffer: PcmBuffer, at: f64) -> Result<(), BridgeError> {
        if self.closed {
            return Err(BridgeError::OutputUnavailable("headless output is closed".to_string()));
        }
        if buffer.sample_rate != self.sample_rate {
            debug!(
                unit_id,
                buffer_rate = buffer.sample_rate,
                output_rate = self.sample_rate,
                "Buffer rate differs from output rate"
            );
        }

        self.timers.retain(|_, timer| !timer.is_finished());

        let end = (at + buffer.duration()).max(0.0);
        let deadline = self.origin + Duration::from_secs_f64(end);
        let ended = self.ended.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = ended.send(unit_id);
        });
        self.timers.insert(unit_id, timer);
        Ok(())
    }

    fn stop(&mut self, unit_id: u64) {
        if let Some(timer) = self.timers.remove(&unit_id) {
            timer.abort();
        }
    }

    fn close(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.closed = true;
    }
}

impl Drop for HeadlessOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Join a device thread that has been told to stop. Inside a runtime the join
/// moves to the blocking pool so the calling task never waits on it.
#[cfg(any(feature = "speaker", test))]
fn release_thread(thread: std::thread::JoinHandle<()>) {
    let join = move || {
        if thread.join().is_err() {
            tracing::warn!("Audio device thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

#[cfg(feature = "speaker")]
pub mod speaker {
    //! cpal-backed output. The cpal stream is not `Send` on every platform, so it
    //! lives on its own thread; the bridge only shares the mixer with it.

    use super::{release_thread, AudioOutput, EndedSender};
    use crate::audio::codec::PcmBuffer;
    use crate::error::BridgeError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{mpsc as std_mpsc, Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use tracing::{error, info};

    struct Voice {
        id: u64,
        start_frame: u64,
        /// Interleaved at the device's channel count and rate
        samples: Vec<f32>,
    }

    struct Mixer {
        voices: Vec<Voice>,
        gain: f32,
        ended: EndedSender,
    }

    pub struct SpeakerOutput {
        mixer: Arc<Mutex<Mixer>>,
        played_frames: Arc<AtomicU64>,
        device_rate: u32,
        device_channels: usize,
        shutdown: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl SpeakerOutput {
        pub fn open(sample_rate: u32, gain: f32, ended: EndedSender) -> Result<Self, BridgeError> {
            let played_frames = Arc::new(AtomicU64::new(0));
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, usize), String>>();
            let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

            let mixer_slot: Arc<Mutex<Option<Arc<Mutex<Mixer>>>>> = Arc::new(Mutex::new(None));
            let slot = mixer_slot.clone();
            let frames = played_frames.clone();

            let thread = thread::spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_output_device() {
                    Some(d) => d,
                    None => {
                        let _ = ready_tx.send(Err("no default output device".to_string()));
                        return;
                    }
                };

                // Ask for the session rate first, fall back to whatever the device prefers
                let requested = cpal::StreamConfig {
                    channels: 1,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                let fallback = device.default_output_config().map(|c| c.config());

                let mixer = Arc::new(Mutex::new(Mixer {
                    voices: Vec::new(),
                    gain,
                    ended,
                }));

                let build = |config: &cpal::StreamConfig| {
                    let mixer = mixer.clone();
                    let frames = frames.clone();
                    let channels = config.channels as usize;
                    device.build_output_stream(
                        config,
                        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                            render(&mixer, &frames, channels, data);
                        },
                        |err| error!("Speaker stream error: {}", err),
                        None,
                    )
                };

                let (stream, config) = match build(&requested) {
                    Ok(stream) => (stream, requested.clone()),
                    Err(first) => match fallback {
                        Ok(config) => match build(&config) {
                            Ok(stream) => (stream, config),
                            Err(e) => {
                                let _ = ready_tx.send(Err(format!("{} / {}", first, e)));
                                return;
                            }
                        },
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{} / {}", first, e)));
                            return;
                        }
                    },
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }

                if let Ok(mut s) = slot.lock() {
                    *s = Some(mixer.clone());
                }
                let _ = ready_tx.send(Ok((config.sample_rate.0, config.channels as usize)));

                // Keep the stream alive until the output is closed
                let _ = shutdown_rx.recv();
                drop(stream);
            });

            let (device_rate, device_channels) = ready_rx
                .recv()
                .map_err(|_| BridgeError::OutputUnavailable("speaker thread exited".to_string()))?
                .map_err(BridgeError::OutputUnavailable)?;

            let mixer = mixer_slot
                .lock()
                .ok()
                .and_then(|mut s| s.take())
                .ok_or_else(|| BridgeError::OutputUnavailable("speaker mixer missing".to_string()))?;

            info!(device_rate, device_channels, "Opened speaker output");

            Ok(Self {
                mixer,
                played_frames,
                device_rate,
                device_channels,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })
        }

        /// Convert a planar buffer to interleaved samples at the device layout.
        fn adapt(&self, buffer: &PcmBuffer) -> Vec<f32> {
            let src_frames = buffer.frames();
            if src_frames == 0 || buffer.sample_rate == 0 {
                return Vec::new();
            }
            let ratio = self.device_rate as f64 / buffer.sample_rate as f64;
            let dst_frames = (src_frames as f64 * ratio).round() as usize;
            let mut out = Vec::with_capacity(dst_frames * self.device_channels);

            for i in 0..dst_frames {
                let pos = i as f64 / ratio;
                let idx = (pos.floor() as usize).min(src_frames - 1);
                let next = (idx + 1).min(src_frames - 1);
                let frac = (pos - idx as f64) as f32;
                for ch in 0..self.device_channels {
                    let source = &buffer.channels[ch.min(buffer.channel_count() - 1)];
                    out.push(source[idx] + (source[next] - source[idx]) * frac);
                }
            }
            out
        }
    }

    fn render(mixer: &Arc<Mutex<Mixer>>, frames: &Arc<AtomicU64>, channels: usize, data: &mut [f32]) {
        let start = frames.load(Ordering::Acquire);
        let count = (data.len() / channels.max(1)) as u64;

        let mut m = match mixer.lock() {
            Ok(m) => m,
            Err(_) => {
                data.iter_mut().for_each(|s| *s = 0.0);
                return;
            }
        };
        let gain = m.gain;

        for (offset, frame) in data.chunks_mut(channels.max(1)).enumerate() {
            let position = start + offset as u64;
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for voice in &m.voices {
                    if position < voice.start_frame {
                        continue;
                    }
                    let idx = (position - voice.start_frame) as usize * channels + ch;
                    if let Some(s) = voice.samples.get(idx) {
                        acc += *s;
                    }
                }
                *sample = (acc * gain).clamp(-1.0, 1.0);
            }
        }

        let end = start + count;
        let mut finished = Vec::new();
        m.voices.retain(|voice| {
            let voice_end = voice.start_frame + (voice.samples.len() / channels.max(1)) as u64;
            if voice_end <= end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        for id in finished {
            let _ = m.ended.send(id);
        }
        frames.store(end, Ordering::Release);
    }

    impl AudioOutput for SpeakerOutput {
        fn now(&self) -> f64 {
            self.played_frames.load(Ordering::Acquire) as f64 / self.device_rate as f64
        }

        fn start(&mut self, unit_id: u64, buffer: PcmBuffer, at: f64) -> Result<(), BridgeError> {
            if self.shutdown.is_none() {
                return Err(BridgeError::OutputUnavailable("speaker output is closed".to_string()));
            }
            let samples = self.adapt(&buffer);
            let start_frame = (at.max(0.0) * self.device_rate as f64).round() as u64;
            let mut m = self
                .mixer
                .lock()
                .map_err(|_| BridgeError::OutputUnavailable("speaker mixer poisoned".to_string()))?;
            m.voices.push(Voice {
                id: unit_id,
                start_frame,
                samples,
            });
            Ok(())
        }

        fn stop(&mut self, unit_id: u64) {
            if let Ok(mut m) = self.mixer.lock() {
                m.voices.retain(|v| v.id != unit_id);
            }
        }

        fn close(&mut self) {
            if let Ok(mut m) = self.mixer.lock() {
                m.voices.clear();
            }
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Some(thread) = self.thread.take() {
                release_thread(thread);
            }
        }
    }

    impl Drop for SpeakerOutput {
        fn drop(&mut self) {
            self.close();
        }
    }
}

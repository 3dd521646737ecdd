//! Audio Device - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Auf dem Audio-Track wird
//! G.711 µ-law (PCMU, 8kHz) übertragen, intern läuft alles mit 48kHz.
//!
//! cpal-Streams sind nicht `Send`, deshalb leben sie auf einem eigenen
//! Thread, der bis `stop()` läuft.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Interne Sample Rate
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// PCMU Sample Rate
pub const PCMU_RATE: u32 = 8000;

/// 20ms @ 8kHz
pub const PCMU_FRAME_SIZE: usize = 160;

const DOWNSAMPLE_FACTOR: usize = (SAMPLE_RATE / PCMU_RATE) as usize;

const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio thread failed: {0}")]
    Thread(String),
}

// ============================================================================
// AUDIO DEVICE
// ============================================================================

/// Mikrofon und Lautsprecher eines Anrufs
pub struct AudioDevice {
    /// Aufgenommenes Audio (48kHz mono)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Zu spielendes Audio (48kHz mono)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    is_muted: Arc<AtomicBool>,

    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl AudioDevice {
    /// Öffnet Mikrofon (Pflicht) und Lautsprecher (optional).
    ///
    /// Blockiert bis die Streams laufen; aus async Code über
    /// `spawn_blocking` aufrufen.
    pub fn start() -> Result<Self, AudioError> {
        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let playback_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let is_muted = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let capture = Arc::clone(&capture_buffer);
        let playback = Arc::clone(&playback_buffer);
        let muted = Arc::clone(&is_muted);

        std::thread::Builder::new()
            .name("skycall-audio".to_string())
            .spawn(move || {
                let host = cpal::default_host();

                let input = match host.default_input_device() {
                    Some(device) => Self::build_input(&device, capture, muted),
                    None => Err(AudioError::NoInputDevice),
                };
                let input = match input {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Ohne Lautsprecher läuft der Anruf weiter, nur ohne Ton
                let output = match host.default_output_device() {
                    Some(device) => match Self::build_output(&device, playback) {
                        Ok(stream) => Some(stream),
                        Err(e) => {
                            tracing::warn!("Audio playback unavailable: {}", e);
                            None
                        }
                    },
                    None => {
                        tracing::warn!("No audio output device found");
                        None
                    }
                };

                let _ = ready_tx.send(Ok(()));

                // Streams leben bis stop() oder Drop
                let _ = stop_rx.recv();
                drop(input);
                drop(output);
                tracing::info!("Audio streams stopped");
            })
            .map_err(|e| AudioError::Thread(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| AudioError::Thread(e.to_string()))??;

        tracing::info!("Audio device started: {}Hz mono", SAMPLE_RATE);

        Ok(Self {
            capture_buffer,
            playback_buffer,
            is_muted,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    fn build_input(
        device: &Device,
        capture_buffer: Arc<Mutex<HeapRb<f32>>>,
        is_muted: Arc<AtomicBool>,
    ) -> Result<cpal::Stream, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if is_muted.load(Ordering::Relaxed) {
                        return;
                    }

                    let mono = downmix(data, channels);
                    let samples = resample(&mono, source_rate, SAMPLE_RATE);

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        Ok(stream)
    }

    fn build_output(
        device: &Device,
        playback_buffer: Arc<Mutex<HeapRb<f32>>>,
    ) -> Result<cpal::Stream, AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let target_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    let needed = (frames as u64 * SAMPLE_RATE as u64 / target_rate as u64) as usize;

                    let source: Vec<f32> = {
                        let mut buffer = playback_buffer.lock();
                        (0..needed).map(|_| buffer.try_pop().unwrap_or(0.0)).collect()
                    };
                    let samples = resample(&source, SAMPLE_RATE, target_rate);

                    for (i, frame) in data.chunks_mut(channels.max(1)).enumerate() {
                        let sample = samples.get(i).copied().unwrap_or(0.0);
                        for s in frame {
                            *s = sample;
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        Ok(stream)
    }

    /// Nächster 20ms Frame vom Mikrofon
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::Relaxed);
        if muted {
            self.capture_buffer.lock().clear();
        }
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    /// Beendet den Audio-Thread. Mehrfacher Aufruf ist harmlos.
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// AUDIO BACKEND
// ============================================================================

/// Laufendes Audio eines Anrufs, wie es die Peer Connection sieht
pub trait CallAudio: Send + Sync {
    /// Nächster 20ms Frame (48kHz mono), `None` solange zu wenig da ist
    fn read_frame(&self) -> Option<Vec<f32>>;
    fn write_samples(&self, samples: &[f32]);
    fn set_muted(&self, muted: bool);
    fn stop(&self);
}

impl CallAudio for AudioDevice {
    fn read_frame(&self) -> Option<Vec<f32>> {
        AudioDevice::read_frame(self)
    }

    fn write_samples(&self, samples: &[f32]) {
        AudioDevice::write_samples(self, samples)
    }

    fn set_muted(&self, muted: bool) {
        AudioDevice::set_muted(self, muted)
    }

    fn stop(&self) {
        AudioDevice::stop(self)
    }
}

/// Öffnet das Audio für einen Anruf. Darf blockieren, wird über
/// `spawn_blocking` aufgerufen.
pub trait AudioBackend: Send + Sync {
    fn open(&self) -> Result<Arc<dyn CallAudio>, AudioError>;
}

/// Mikrofon und Lautsprecher über cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalAudio;

impl AudioBackend for CpalAudio {
    fn open(&self) -> Result<Arc<dyn CallAudio>, AudioError> {
        let device: Arc<dyn CallAudio> = Arc::new(AudioDevice::start()?);
        Ok(device)
    }
}

/// Priorität: 48kHz F32 > F32 mit anderer Rate > erste Konfiguration
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| AudioError::UnsupportedConfig("No suitable audio configuration found".to_string()))
}

// ============================================================================
// PCM HELPERS
// ============================================================================

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Lineares Resampling
fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// G.711 µ-law
// ============================================================================

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte as i32;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;

    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// 48kHz Frame → PCMU Payload (8kHz)
pub fn encode_frame(frame: &[f32]) -> Vec<u8> {
    frame
        .chunks(DOWNSAMPLE_FACTOR)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .map(|s| linear_to_ulaw((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

/// PCMU Payload → 48kHz Samples
pub fn decode_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| ulaw_to_linear(*b) as f32 / 32768.0)
        .flat_map(|s| std::iter::repeat(s).take(DOWNSAMPLE_FACTOR))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_silence() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn test_ulaw_sign_bit() {
        for sample in [1, 100, 1000, 12000, 32000] {
            assert_eq!(linear_to_ulaw(sample) ^ linear_to_ulaw(-sample), 0x80);
        }
    }

    #[test]
    fn test_ulaw_quantization_error_is_bounded() {
        for sample in (-32000i32..32000).step_by(997) {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample as i16)) as i32;
            let bound = (sample.abs() + ULAW_BIAS) / 16 + 1;
            assert!(
                (decoded - sample).abs() <= bound,
                "sample {} decoded to {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_ulaw_clips_extremes() {
        assert_eq!(linear_to_ulaw(i16::MIN), linear_to_ulaw(-ULAW_CLIP as i16));
        assert_eq!(linear_to_ulaw(i16::MAX), linear_to_ulaw(ULAW_CLIP as i16));
    }

    #[test]
    fn test_frame_sizes() {
        let frame = vec![0.25f32; FRAME_SIZE];
        let payload = encode_frame(&frame);
        assert_eq!(payload.len(), PCMU_FRAME_SIZE);
        assert_eq!(decode_payload(&payload).len(), FRAME_SIZE);
    }

    #[test]
    fn test_downmix_and_resample() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(resample(&[0.0; 100], 24000, 48000).len(), 200);
        assert_eq!(resample(&[0.0; 100], 96000, 48000).len(), 50);
        assert_eq!(resample(&[1.0, 2.0], 48000, 48000), vec![1.0, 2.0]);
    }
}

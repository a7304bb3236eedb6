// Microphone capture.
//
// `CaptureSource` is the seam between the session and the hardware: the cpal
// implementation lives behind it so tests can drive the session with scripted
// frames. Frames are fixed-size mono f32 buffers at the capture rate; the
// controller encodes them into outbound packets and computes speech activity
// per frame.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::SessionError;

/// Configuration for the capture side of a session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture sample rate in Hz (the rate sent to the model)
    pub sample_rate: u32,
    /// Samples per emitted frame
    pub frame_samples: usize,
    /// RMS energy above this counts as speech
    pub rms_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 4096,
            rms_threshold: 0.01,
        }
    }
}

/// A fixed-size frame of mono audio pulled from the capture device.
///
/// Samples are normalized `f32` in `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl CaptureFrame {
    /// Root-mean-square energy of the frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean_sq: f32 =
            self.samples.iter().map(|s| s * s).sum::<f32>() / self.samples.len() as f32;
        mean_sq.sqrt()
    }

    /// Whether this frame counts as speech at the given RMS threshold.
    pub fn is_speech(&self, threshold: f32) -> bool {
        self.rms() > threshold
    }
}

/// Capture source trait
///
/// Implementations:
/// - `MicSource`: cpal default input device (all platforms)
/// - test doubles that feed scripted frames
#[async_trait::async_trait]
pub trait CaptureSource: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive capture frames
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureFrame>, SessionError>;

    /// Stop capturing audio
    async fn stop(&mut self) -> Result<()>;

    /// Check if the source is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get source name for logging
    fn name(&self) -> &str;
}

/// Microphone capture via the system default cpal input device.
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread for the
/// lifetime of the capture; the device callback downmixes to mono, decimates
/// to the target rate, and slices the result into fixed frames.
pub struct MicSource {
    config: CaptureConfig,
    stop_flag: Arc<AtomicBool>,
    capturing: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MicSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            capturing: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

#[async_trait::async_trait]
impl CaptureSource for MicSource {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureFrame>, SessionError> {
        let (frame_tx, frame_rx) = mpsc::channel::<CaptureFrame>(16);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<(), String>>();

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let capturing = Arc::clone(&self.capturing);
        let config = self.config.clone();

        let thread = std::thread::spawn(move || {
            let stream = match build_input_stream(&config, frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            capturing.store(true, Ordering::SeqCst);
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }

            drop(stream);
            capturing.store(false, Ordering::SeqCst);
            info!("Microphone capture thread stopped");
        });

        self.thread = Some(thread);

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Microphone capture started at {} Hz", self.config.sample_rate);
                Ok(frame_rx)
            }
            Ok(Err(e)) => Err(SessionError::DeviceUnavailable(e)),
            Err(_) => Err(SessionError::DeviceUnavailable(
                "capture thread exited before reporting readiness".to_string(),
            )),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    error!("Capture thread panicked");
                }
            })
            .await?;
        }

        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "cpal-microphone"
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    frame_tx: mpsc::Sender<CaptureFrame>,
) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no default input device"))?;

    let supported = device.default_input_config()?;
    let device_rate = supported.sample_rate().0;
    let device_channels = supported.channels() as usize;
    let stream_config: cpal::StreamConfig = supported.into();

    let target_rate = config.sample_rate;
    let frame_samples = config.frame_samples;
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono = downmix_to_mono(data, device_channels);
            let resampled = decimate(&mono, device_rate, target_rate);
            pending.extend_from_slice(&resampled);

            while pending.len() >= frame_samples {
                let rest = pending.split_off(frame_samples);
                let frame = CaptureFrame {
                    samples: std::mem::replace(&mut pending, rest),
                    sample_rate: target_rate,
                };
                // This channel bounds latency at the device edge: a stalled
                // consumer loses the newest frame rather than blocking the
                // audio callback. Frames that get through are still subject
                // to the outbound queue's drop-oldest policy.
                if frame_tx.try_send(frame).is_err() {
                    warn!("Capture frame dropped: consumer not keeping up");
                }
            }
        },
        |err: cpal::StreamError| {
            error!("cpal input stream error: {err}");
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

/// Average interleaved channels down to mono.
fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }

    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Downsample by decimation: take every Nth sample.
///
/// Device rates are assumed to be integer multiples of the target rate
/// (48000 or 32000 against 16000); anything else passes through unchanged.
fn decimate(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate <= target_rate {
        return samples.to_vec();
    }

    let ratio = source_rate / target_rate;
    if ratio <= 1 {
        return samples.to_vec();
    }

    samples.iter().step_by(ratio as usize).copied().collect()
}

// Gapless playback scheduling.
//
// The model streams audio faster or slower than real time; the scheduler's
// job is to keep playback continuous regardless. Each decoded chunk is
// committed to the output timeline at `max(next_start, clock now)`, so chunks
// queue back-to-back when they arrive early and start immediately when they
// arrive late. Barge-in clears everything at once.
//
// `next_start` and the active-handle set are owned exclusively by the
// scheduler, which in turn is owned by the session dispatch loop. The
// transport never touches scheduling state directly; chunks come in through
// `enqueue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info};

use crate::error::SessionError;

/// Output device abstraction.
///
/// `position` is a clock on the playback timeline; it advances as the device
/// consumes samples whether or not audio is queued. All methods are
/// computation-only and never suspend.
pub trait OutputSink: Send + Sync {
    /// Current position on the output clock.
    fn position(&self) -> Duration;

    /// Commit samples to begin playing at `start` on the output clock.
    ///
    /// `start` is never earlier than the end of previously committed audio;
    /// any gap up to `start` is filled with silence.
    fn enqueue_at(&self, start: Duration, samples: Vec<f32>);

    /// Immediately silence everything that has been committed but not played.
    fn stop_all(&self);

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;
}

/// One chunk committed to the output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub id: u64,
    pub start: Duration,
    pub end: Duration,
}

/// Schedules inbound audio chunks for back-to-back playback.
pub struct PlaybackScheduler {
    sink: Arc<dyn OutputSink>,
    next_start: Duration,
    active: Vec<ScheduledChunk>,
    next_id: u64,
    speaking: Arc<AtomicBool>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn OutputSink>, speaking: Arc<AtomicBool>) -> Self {
        Self {
            sink,
            next_start: Duration::ZERO,
            active: Vec::new(),
            next_id: 0,
            speaking,
        }
    }

    /// Schedule a decoded chunk; returns its start time on the output clock.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Duration {
        let duration = Duration::from_secs_f64(
            samples.len() as f64 / self.sink.sample_rate() as f64,
        );

        let now = self.sink.position();
        let start = self.next_start.max(now);

        self.sink.enqueue_at(start, samples);

        let chunk = ScheduledChunk {
            id: self.next_id,
            start,
            end: start + duration,
        };
        self.next_id += 1;
        self.active.push(chunk);
        self.next_start = chunk.end;
        self.update_speaking();

        debug!(
            "Scheduled chunk {} at {:?} for {:?}",
            chunk.id, chunk.start, duration
        );

        start
    }

    /// Drop handles whose playback has completed.
    pub fn prune(&mut self) {
        let now = self.sink.position();
        self.active.retain(|chunk| chunk.end > now);
        self.update_speaking();
    }

    /// Barge-in: silence everything now and reset the timeline.
    pub fn interrupt(&mut self) {
        let stopped = self.active.len();
        self.sink.stop_all();
        self.active.clear();
        self.next_start = Duration::ZERO;
        self.update_speaking();

        if stopped > 0 {
            info!("Playback interrupted: {} chunks force-stopped", stopped);
        }
    }

    /// True while any scheduled chunk has not finished playing.
    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    fn update_speaking(&self) {
        self.speaking
            .store(!self.active.is_empty(), Ordering::SeqCst);
    }
}

/// Acquires an output sink when a session starts.
///
/// The output device is owned by one session at a time, so acquisition is
/// deferred until `SessionController::start` rather than done at construction.
#[async_trait::async_trait]
pub trait OutputSinkFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn OutputSink>, SessionError>;
}

/// Factory for the default cpal output device.
pub struct CpalSinkFactory {
    pub sample_rate: u32,
}

#[async_trait::async_trait]
impl OutputSinkFactory for CpalSinkFactory {
    async fn open(&self) -> Result<Arc<dyn OutputSink>, SessionError> {
        Ok(Arc::new(CpalSink::open(self.sample_rate).await?))
    }
}

// ---------------------------------------------------------------------------
// cpal output sink
// ---------------------------------------------------------------------------

struct SinkShared {
    /// Samples committed but not yet handed to the device.
    queue: VecDeque<f32>,
    /// Total samples the device has consumed, including silence.
    consumed: u64,
}

/// Speaker output via the system default cpal output device.
///
/// The device callback drains a sample FIFO, emitting silence when the FIFO
/// is empty; the clock counts every sample the device consumes, so it keeps
/// advancing across idle periods. The cpal stream is not `Send` and lives on
/// its own thread.
pub struct CpalSink {
    shared: Arc<Mutex<SinkShared>>,
    sample_rate: u32,
    stop_flag: Arc<AtomicBool>,
}

impl CpalSink {
    /// Open the default output device at the given rate.
    pub async fn open(sample_rate: u32) -> Result<Self, SessionError> {
        let shared = Arc::new(Mutex::new(SinkShared {
            queue: VecDeque::new(),
            consumed: 0,
        }));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<(), String>>();
        let thread_shared = Arc::clone(&shared);
        let thread_stop = Arc::clone(&stop_flag);

        std::thread::spawn(move || {
            let stream = match build_output_stream(sample_rate, thread_shared) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            while !thread_stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }

            drop(stream);
            info!("Playback output thread stopped");
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Playback output opened at {} Hz", sample_rate);
                Ok(Self {
                    shared,
                    sample_rate,
                    stop_flag,
                })
            }
            Ok(Err(e)) => Err(SessionError::DeviceUnavailable(e)),
            Err(_) => Err(SessionError::DeviceUnavailable(
                "output thread exited before reporting readiness".to_string(),
            )),
        }
    }
}

impl OutputSink for CpalSink {
    fn position(&self) -> Duration {
        let shared = self.shared.lock().expect("sink lock poisoned");
        Duration::from_secs_f64(shared.consumed as f64 / self.sample_rate as f64)
    }

    fn enqueue_at(&self, start: Duration, samples: Vec<f32>) {
        let mut shared = self.shared.lock().expect("sink lock poisoned");

        let start_sample = (start.as_secs_f64() * self.sample_rate as f64).round() as u64;
        let write_head = shared.consumed + shared.queue.len() as u64;

        // Pad with silence up to the requested start.
        for _ in write_head..start_sample {
            shared.queue.push_back(0.0);
        }

        shared.queue.extend(samples);
    }

    fn stop_all(&self) {
        let mut shared = self.shared.lock().expect("sink lock poisoned");
        shared.queue.clear();
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

fn build_output_stream(
    sample_rate: u32,
    shared: Arc<Mutex<SinkShared>>,
) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no default output device"))?;

    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut shared = shared.lock().expect("sink lock poisoned");
            for out in data.iter_mut() {
                *out = shared.queue.pop_front().unwrap_or(0.0);
            }
            shared.consumed += data.len() as u64;
        },
        |err: cpal::StreamError| {
            error!("cpal output stream error: {err}");
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

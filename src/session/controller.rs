use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::stats::SessionStats;
use super::transcript::{TranscriptAggregator, TranscriptEntry};
use crate::audio::{pcm, CaptureSource, OutputSink, OutputSinkFactory, PlaybackScheduler};
use crate::error::SessionError;
use crate::transport::{pcm_mime_format, InboundEvent, OutboundMessage, OutboundQueue, Transport};

/// Session connection state.
///
/// Exactly one state is active at a time; transitions happen only inside the
/// controller, in response to transport lifecycle events or explicit stop
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// State readable from outside the dispatch loop.
struct Shared {
    state: StdMutex<SessionState>,
    transcript: StdMutex<Vec<TranscriptEntry>>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
    frames_captured: AtomicU64,
    chunks_scheduled: AtomicU64,
}

/// Orchestrates capture, transport, and playback for one live voice session.
///
/// Three tasks run while the session is connected:
/// - a capture task turning microphone frames into outbound packets,
/// - a sender task draining the bounded outbound queue onto the transport,
/// - a dispatch task consuming inbound events in strict arrival order.
///
/// The playback scheduler and transcript aggregator are owned exclusively by
/// the dispatch task, so their state is never mutated from two places.
pub struct SessionController {
    config: SessionConfig,
    shared: Arc<Shared>,
    capture: Arc<Mutex<Box<dyn CaptureSource>>>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    sink_factory: Box<dyn OutputSinkFactory>,
    outbound: StdMutex<Option<Arc<OutboundQueue>>>,
    running: StdMutex<Option<Arc<watch::Sender<bool>>>>,
    // Bumped by every stop(); a start() still acquiring resources compares
    // against the value it read under the state lock and aborts if a stop
    // landed in between.
    epoch: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active_sink: StdMutex<Option<Arc<dyn OutputSink>>>,
    speaking: Arc<AtomicBool>,
    speech_activity: Arc<AtomicBool>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        capture: Box<dyn CaptureSource>,
        transport: Box<dyn Transport>,
        sink_factory: Box<dyn OutputSinkFactory>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: StdMutex::new(SessionState::Disconnected),
                transcript: StdMutex::new(Vec::new()),
                started_at: StdMutex::new(None),
                frames_captured: AtomicU64::new(0),
                chunks_scheduled: AtomicU64::new(0),
            }),
            capture: Arc::new(Mutex::new(capture)),
            transport: Arc::new(Mutex::new(transport)),
            sink_factory,
            outbound: StdMutex::new(None),
            running: StdMutex::new(None),
            epoch: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            active_sink: StdMutex::new(None),
            speaking: Arc::new(AtomicBool::new(false)),
            speech_activity: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the session: acquire devices, open the transport, spawn tasks.
    ///
    /// Valid from `Disconnected` or `Error` only; the capture and output
    /// devices are owned exclusively by one active session. A `stop()` that
    /// races a start in progress wins: the start releases whatever it had
    /// acquired and returns `Cancelled` instead of going connected.
    pub async fn start(&self) -> Result<(), SessionError> {
        let epoch = {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            match *state {
                SessionState::Disconnected | SessionState::Error => {
                    *state = SessionState::Connecting;
                }
                _ => return Err(SessionError::AlreadyActive),
            }
            self.epoch.load(Ordering::SeqCst)
        };

        info!("Starting session {}", self.config.session_id);
        *self.shared.started_at.lock().expect("lock poisoned") = Some(Utc::now());

        // Reap tasks from a previous run of this controller.
        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.drain(..) {
                if task.await.is_err() {
                    error!("Session task from previous run panicked");
                }
            }
        }

        let frame_rx = match self.capture.lock().await.start().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Capture device unavailable: {}", e);
                self.set_state(SessionState::Error);
                return Err(e);
            }
        };
        if self.cancelled(epoch) {
            return self.abort_startup(None, false).await;
        }

        let sink = match self.sink_factory.open().await {
            Ok(sink) => sink,
            Err(e) => {
                error!("Output device unavailable: {}", e);
                self.release_partial(None, false).await;
                self.set_state(SessionState::Error);
                return Err(e);
            }
        };
        if self.cancelled(epoch) {
            return self.abort_startup(Some(&sink), false).await;
        }

        let event_rx = match self.transport.lock().await.open(&self.config).await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Transport open failed: {}", e);
                self.release_partial(Some(&sink), false).await;
                self.set_state(SessionState::Error);
                return Err(e);
            }
        };

        let (running_tx, running_rx) = watch::channel(true);
        let running_tx = Arc::new(running_tx);
        let outbound = Arc::new(OutboundQueue::new(self.config.outbound_queue_capacity));

        // Send failures reported by the sender task are routed into the
        // dispatch loop alongside transport events.
        let (internal_tx, internal_rx) = mpsc::channel::<InboundEvent>(4);

        // Commit under the state lock: the epoch recheck and the transition
        // to Connected are one atomic step against stop(), and no await sits
        // between the commit and the task spawns below.
        let mut tasks = self.tasks.lock().await;
        let committed = {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            if self.epoch.load(Ordering::SeqCst) == epoch {
                *self.running.lock().expect("lock poisoned") = Some(Arc::clone(&running_tx));
                *self.active_sink.lock().expect("lock poisoned") = Some(Arc::clone(&sink));
                *self.outbound.lock().expect("lock poisoned") = Some(Arc::clone(&outbound));
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        };
        if !committed {
            drop(tasks);
            return self.abort_startup(Some(&sink), true).await;
        }

        info!("Session {} connected", self.config.session_id);

        tasks.push(self.spawn_capture_task(frame_rx, Arc::clone(&outbound), running_rx.clone()));
        tasks.push(self.spawn_sender_task(outbound, internal_tx, running_rx.clone()));
        tasks.push(self.spawn_dispatch_task(event_rx, internal_rx, sink, running_tx, running_rx));

        Ok(())
    }

    fn cancelled(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    /// A stop landed while startup was still acquiring resources: release
    /// whatever this attempt holds and surface the cancellation.
    async fn abort_startup(
        &self,
        sink: Option<&Arc<dyn OutputSink>>,
        close_transport: bool,
    ) -> Result<(), SessionError> {
        info!("Session {} stopped during startup", self.config.session_id);
        self.release_partial(sink, close_transport).await;
        self.set_state(SessionState::Disconnected);
        Err(SessionError::Cancelled)
    }

    /// Release resources acquired by a startup attempt that will not run.
    async fn release_partial(&self, sink: Option<&Arc<dyn OutputSink>>, close_transport: bool) {
        if let Err(e) = self.capture.lock().await.stop().await {
            error!("Failed to release capture device: {}", e);
        }
        if let Some(sink) = sink {
            sink.stop_all();
        }
        if close_transport {
            if let Err(e) = self.transport.lock().await.close().await {
                error!("Failed to close transport: {}", e);
            }
        }
    }

    /// Stop the session and release everything it holds.
    ///
    /// Idempotent: a no-op when already disconnected. Once this returns, no
    /// further audio plays and no further packets are sent, even if closing
    /// the transport itself failed or a `start()` was still in flight.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.shared.state.lock().expect("state lock poisoned");
            if *state == SessionState::Disconnected {
                debug!("Stop requested while already disconnected");
                return Ok(());
            }
            // Invalidate any start() still acquiring resources; it rechecks
            // the epoch before committing and aborts instead of connecting.
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }

        info!("Stopping session {}", self.config.session_id);

        if let Some(running) = self.running.lock().expect("lock poisoned").take() {
            let _ = running.send(false);
        }

        // Silence output first; nothing below may delay it.
        if let Some(sink) = self.active_sink.lock().expect("lock poisoned").take() {
            sink.stop_all();
        }

        if let Err(e) = self.capture.lock().await.stop().await {
            error!("Failed to release capture device: {}", e);
        }

        if let Err(e) = self.transport.lock().await.close().await {
            error!("Failed to close transport: {}", e);
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if task.await.is_err() {
                error!("Session task panicked");
            }
        }

        self.speech_activity.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Disconnected);
        info!("Session {} stopped", self.config.session_id);
        Ok(())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().expect("state lock poisoned")
    }

    /// Finalized transcript entries, in turn-completion order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared
            .transcript
            .lock()
            .expect("transcript lock poisoned")
            .clone()
    }

    /// True while any scheduled model audio has not finished playing.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// True when the most recent capture frame exceeded the speech threshold.
    pub fn speech_activity(&self) -> bool {
        self.speech_activity.load(Ordering::SeqCst)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        let started_at = *self.shared.started_at.lock().expect("lock poisoned");
        let duration_secs = started_at
            .map(|t| Utc::now().signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let packets_dropped = self
            .outbound
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|q| q.dropped())
            .unwrap_or(0);

        SessionStats {
            state: self.state(),
            started_at,
            duration_secs,
            frames_captured: self.shared.frames_captured.load(Ordering::SeqCst),
            packets_dropped,
            chunks_scheduled: self.shared.chunks_scheduled.load(Ordering::SeqCst),
            transcript_entries: self
                .shared
                .transcript
                .lock()
                .expect("transcript lock poisoned")
                .len(),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock().expect("state lock poisoned") = state;
    }

    fn spawn_capture_task(
        &self,
        mut frame_rx: mpsc::Receiver<crate::audio::CaptureFrame>,
        outbound: Arc<OutboundQueue>,
        mut running: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let speech_activity = Arc::clone(&self.speech_activity);
        let threshold = self.config.capture.rms_threshold;
        let mime_format = pcm_mime_format(self.config.capture.sample_rate);

        tokio::spawn(async move {
            info!("Capture task started");

            loop {
                tokio::select! {
                    maybe_frame = frame_rx.recv() => {
                        let Some(frame) = maybe_frame else { break };

                        speech_activity.store(frame.is_speech(threshold), Ordering::SeqCst);
                        shared.frames_captured.fetch_add(1, Ordering::SeqCst);

                        let samples = pcm::float_to_pcm16(&frame.samples);
                        let bytes = pcm::pcm16_to_bytes(&samples);
                        outbound.push(OutboundMessage::Audio {
                            data: pcm::encode_base64(&bytes),
                            mime_format: mime_format.clone(),
                        });
                    }
                    _ = running.changed() => {
                        if !*running.borrow() {
                            break;
                        }
                    }
                }
            }

            speech_activity.store(false, Ordering::SeqCst);
            info!("Capture task stopped");
        })
    }

    fn spawn_sender_task(
        &self,
        outbound: Arc<OutboundQueue>,
        internal_tx: mpsc::Sender<InboundEvent>,
        mut running: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);

        tokio::spawn(async move {
            info!("Sender task started");

            loop {
                if !*running.borrow() {
                    break;
                }

                tokio::select! {
                    message = outbound.pop() => {
                        let result = transport.lock().await.send(message).await;
                        if let Err(e) = result {
                            error!("Outbound send failed: {}", e);
                            let _ = internal_tx
                                .send(InboundEvent::Error { message: e.to_string() })
                                .await;
                            break;
                        }
                    }
                    _ = running.changed() => {
                        if !*running.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Sender task stopped");
        })
    }

    fn spawn_dispatch_task(
        &self,
        mut event_rx: mpsc::Receiver<InboundEvent>,
        mut internal_rx: mpsc::Receiver<InboundEvent>,
        sink: Arc<dyn OutputSink>,
        running_tx: Arc<watch::Sender<bool>>,
        mut running: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let capture = Arc::clone(&self.capture);
        let transport = Arc::clone(&self.transport);
        let speaking = Arc::clone(&self.speaking);

        tokio::spawn(async move {
            info!("Dispatch task started");

            let mut scheduler = PlaybackScheduler::new(sink, speaking);
            let mut aggregator = TranscriptAggregator::new();
            let mut tick = tokio::time::interval(Duration::from_millis(20));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let terminal = tokio::select! {
                    maybe_event = event_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                handle_event(event, &mut scheduler, &mut aggregator, &shared)
                            }
                            // Transport dropped its sender without a Closed
                            // event; treat as a close.
                            None => Some(SessionState::Disconnected),
                        }
                    }
                    Some(event) = internal_rx.recv() => {
                        handle_event(event, &mut scheduler, &mut aggregator, &shared)
                    }
                    _ = tick.tick() => {
                        scheduler.prune();
                        None
                    }
                    _ = running.changed() => {
                        if !*running.borrow() {
                            // Explicit stop: discard partial turns, end sound.
                            aggregator.discard();
                            scheduler.interrupt();
                            break;
                        }
                        None
                    }
                };

                if let Some(target) = terminal {
                    // Inbound-driven teardown: partial turns are discarded,
                    // not flushed.
                    aggregator.discard();
                    scheduler.interrupt();
                    let _ = running_tx.send(false);

                    if let Err(e) = capture.lock().await.stop().await {
                        error!("Failed to release capture device: {}", e);
                    }
                    if let Err(e) = transport.lock().await.close().await {
                        error!("Failed to close transport: {}", e);
                    }

                    *shared.state.lock().expect("state lock poisoned") = target;
                    info!("Session torn down to {:?}", target);
                    break;
                }
            }

            info!("Dispatch task stopped");
        })
    }
}

/// Apply one inbound event to the session.
///
/// Returns the terminal state to tear down to, if the event ends the session.
fn handle_event(
    event: InboundEvent,
    scheduler: &mut PlaybackScheduler,
    aggregator: &mut TranscriptAggregator,
    shared: &Shared,
) -> Option<SessionState> {
    match event {
        InboundEvent::TranscriptDelta { role, text } => {
            aggregator.push(role, &text);
            None
        }
        InboundEvent::AudioChunk { data, mime_format } => {
            match decode_chunk(&data) {
                Ok(samples) => {
                    scheduler.enqueue(samples);
                    shared.chunks_scheduled.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    // Skip and continue; one bad chunk must not stall playback.
                    warn!("Dropping undecodable audio chunk ({}): {}", mime_format, e);
                }
            }
            None
        }
        InboundEvent::TurnComplete => {
            let entries = aggregator.finish_turn();
            if !entries.is_empty() {
                debug!("Turn complete: {} transcript entries", entries.len());
                shared
                    .transcript
                    .lock()
                    .expect("transcript lock poisoned")
                    .extend(entries);
            }
            None
        }
        InboundEvent::Interrupted => {
            info!("Barge-in: stopping playback");
            scheduler.interrupt();
            None
        }
        InboundEvent::Error { message } => {
            error!("Remote session error: {}", message);
            Some(SessionState::Error)
        }
        InboundEvent::Closed => {
            info!("Remote session closed");
            Some(SessionState::Disconnected)
        }
    }
}

fn decode_chunk(data: &str) -> Result<Vec<f32>, crate::error::DecodeError> {
    let bytes = pcm::decode_base64(data)?;
    let samples = pcm::bytes_to_pcm16(&bytes)?;
    Ok(pcm::pcm16_to_float(&samples))
}

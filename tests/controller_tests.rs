// Session controller integration tests.
//
// These drive the full controller with a scripted transport, a fake capture
// source, and a manual-clock output sink, so state transitions, transcript
// assembly, barge-in, and teardown can be asserted without real devices or
// network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use voicebridge::audio::pcm;
use voicebridge::audio::{CaptureFrame, CaptureSource, OutputSink, OutputSinkFactory};
use voicebridge::error::SessionError;
use voicebridge::session::{SessionConfig, SessionController, SessionState};
use voicebridge::transport::{pcm_mime_format, InboundEvent, OutboundMessage, Role, Transport};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TransportProbe {
    sent: Arc<StdMutex<Vec<OutboundMessage>>>,
    event_tx: Arc<StdMutex<Option<mpsc::Sender<InboundEvent>>>>,
    close_calls: Arc<AtomicUsize>,
}

impl TransportProbe {
    async fn emit(&self, event: InboundEvent) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("transport not open");
        tx.send(event).await.expect("dispatch loop gone");
    }

    fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

struct ScriptedTransport {
    probe: TransportProbe,
    fail_open: bool,
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &mut self,
        _config: &SessionConfig,
    ) -> Result<mpsc::Receiver<InboundEvent>, SessionError> {
        if self.fail_open {
            return Err(SessionError::TransportOpenFailed(
                "scripted failure".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.probe.event_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.probe.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.probe.event_tx.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CaptureProbe {
    frame_tx: Arc<StdMutex<Option<mpsc::Sender<CaptureFrame>>>>,
    capturing: Arc<AtomicBool>,
}

impl CaptureProbe {
    async fn emit(&self, samples: Vec<f32>) {
        let tx = self
            .frame_tx
            .lock()
            .unwrap()
            .clone()
            .expect("capture not started");
        tx.send(CaptureFrame {
            samples,
            sample_rate: 16000,
        })
        .await
        .expect("capture task gone");
    }
}

struct FakeCapture {
    probe: CaptureProbe,
    fail: bool,
}

#[async_trait::async_trait]
impl CaptureSource for FakeCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureFrame>, SessionError> {
        if self.fail {
            return Err(SessionError::DeviceUnavailable(
                "no microphone in tests".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(16);
        *self.probe.frame_tx.lock().unwrap() = Some(tx);
        self.probe.capturing.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.probe.capturing.store(false, Ordering::SeqCst);
        *self.probe.frame_tx.lock().unwrap() = None;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.probe.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "fake-capture"
    }
}

struct ManualSink {
    now: StdMutex<Duration>,
    committed: StdMutex<Vec<(Duration, usize)>>,
    stop_calls: AtomicUsize,
    rate: u32,
}

impl ManualSink {
    fn new(rate: u32) -> Self {
        Self {
            now: StdMutex::new(Duration::ZERO),
            committed: StdMutex::new(Vec::new()),
            stop_calls: AtomicUsize::new(0),
            rate,
        }
    }
}

impl OutputSink for ManualSink {
    fn position(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn enqueue_at(&self, start: Duration, samples: Vec<f32>) {
        self.committed.lock().unwrap().push((start, samples.len()));
    }

    fn stop_all(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

struct ManualSinkFactory {
    sink: Arc<ManualSink>,
}

#[async_trait::async_trait]
impl OutputSinkFactory for ManualSinkFactory {
    async fn open(&self) -> Result<Arc<dyn OutputSink>, SessionError> {
        Ok(Arc::clone(&self.sink) as Arc<dyn OutputSink>)
    }
}

// Sink factory that suspends until a permit is released, holding startup
// open at a controllable point.
struct GatedSinkFactory {
    sink: Arc<ManualSink>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait::async_trait]
impl OutputSinkFactory for GatedSinkFactory {
    async fn open(&self) -> Result<Arc<dyn OutputSink>, SessionError> {
        self.gate.acquire().await.expect("gate closed").forget();
        Ok(Arc::clone(&self.sink) as Arc<dyn OutputSink>)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    controller: SessionController,
    transport: TransportProbe,
    capture: CaptureProbe,
    sink: Arc<ManualSink>,
}

fn harness() -> Harness {
    harness_with(false, false)
}

fn harness_with(fail_capture: bool, fail_transport: bool) -> Harness {
    let transport = TransportProbe::default();
    let capture = CaptureProbe::default();
    let sink = Arc::new(ManualSink::new(24000));

    let controller = SessionController::new(
        SessionConfig::default(),
        Box::new(FakeCapture {
            probe: capture.clone(),
            fail: fail_capture,
        }),
        Box::new(ScriptedTransport {
            probe: transport.clone(),
            fail_open: fail_transport,
        }),
        Box::new(ManualSinkFactory {
            sink: Arc::clone(&sink),
        }),
    );

    Harness {
        controller,
        transport,
        capture,
        sink,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn audio_chunk_event(samples: &[i16]) -> InboundEvent {
    InboundEvent::AudioChunk {
        data: pcm::encode_base64(&pcm::pcm16_to_bytes(samples)),
        mime_format: pcm_mime_format(24000),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_connects_and_stop_disconnects() {
    let h = harness();
    assert_eq!(h.controller.state(), SessionState::Disconnected);

    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);
    assert!(h.capture.capturing.load(Ordering::SeqCst));

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Disconnected);
    assert!(!h.capture.capturing.load(Ordering::SeqCst));
    assert!(h.transport.close_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.controller.stop().await.unwrap();
    let closes_after_first = h.transport.close_calls.load(Ordering::SeqCst);

    h.controller.stop().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Disconnected);
    // Second stop is a no-op: no double release.
    assert_eq!(h.transport.close_calls.load(Ordering::SeqCst), closes_after_first);
}

#[tokio::test]
async fn starting_while_connected_is_rejected() {
    let h = harness();
    h.controller.start().await.unwrap();

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyActive));
    assert_eq!(h.controller.state(), SessionState::Connected);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn stop_during_startup_wins_over_start() {
    let transport = TransportProbe::default();
    let capture = CaptureProbe::default();
    let sink = Arc::new(ManualSink::new(24000));
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let controller = Arc::new(SessionController::new(
        SessionConfig::default(),
        Box::new(FakeCapture {
            probe: capture.clone(),
            fail: false,
        }),
        Box::new(ScriptedTransport {
            probe: transport.clone(),
            fail_open: false,
        }),
        Box::new(GatedSinkFactory {
            sink,
            gate: Arc::clone(&gate),
        }),
    ));

    let starter = Arc::clone(&controller);
    let start_task = tokio::spawn(async move { starter.start().await });

    // Startup has the microphone and is suspended on the output device.
    wait_for(|| capture.capturing.load(Ordering::SeqCst)).await;
    assert_eq!(controller.state(), SessionState::Connecting);

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), SessionState::Disconnected);

    // Let the suspended start resume; it must tear down, not come up.
    gate.add_permits(1);
    let result = start_task.await.unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));

    assert_eq!(controller.state(), SessionState::Disconnected);
    assert!(!capture.capturing.load(Ordering::SeqCst));
    assert!(transport.sent_messages().is_empty());

    // The aborted start leaves the controller fully restartable.
    gate.add_permits(1);
    controller.start().await.unwrap();
    assert_eq!(controller.state(), SessionState::Connected);

    capture.emit(vec![0.1; 64]).await;
    wait_for(|| !transport.sent_messages().is_empty()).await;

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn capture_device_failure_enters_error_state() {
    let h = harness_with(true, false);

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceUnavailable(_)));
    assert_eq!(h.controller.state(), SessionState::Error);
}

#[tokio::test]
async fn transport_open_failure_enters_error_state_and_releases_capture() {
    let h = harness_with(false, true);

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, SessionError::TransportOpenFailed(_)));
    assert_eq!(h.controller.state(), SessionState::Error);
    assert!(!h.capture.capturing.load(Ordering::SeqCst));
}

#[tokio::test]
async fn session_restarts_after_error() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport
        .emit(InboundEvent::Error {
            message: "remote fault".to_string(),
        })
        .await;
    wait_for(|| h.controller.state() == SessionState::Error).await;
    assert!(!h.capture.capturing.load(Ordering::SeqCst));

    // Error is terminal until an explicit restart.
    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Connected);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn remote_close_disconnects() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport.emit(InboundEvent::Closed).await;
    wait_for(|| h.controller.state() == SessionState::Disconnected).await;
    assert!(!h.capture.capturing.load(Ordering::SeqCst));
}

#[tokio::test]
async fn captured_frames_become_ordered_outbound_packets() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.capture.emit(vec![0.5; 8]).await;
    h.capture.emit(vec![-0.25; 8]).await;
    wait_for(|| h.transport.sent_messages().len() == 2).await;

    let sent = h.transport.sent_messages();
    for (i, expected) in [0.5f32, -0.25].iter().enumerate() {
        match &sent[i] {
            OutboundMessage::Audio { data, mime_format } => {
                assert_eq!(mime_format, "audio/pcm;rate=16000");
                let decoded =
                    pcm::bytes_to_pcm16(&pcm::decode_base64(data).unwrap()).unwrap();
                let expected_pcm = pcm::float_to_pcm16(&[*expected])[0];
                assert!(decoded.iter().all(|&s| s == expected_pcm));
            }
            other => panic!("expected audio packet, got {:?}", other),
        }
    }

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn speech_activity_follows_frame_energy() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.capture.emit(vec![0.5; 256]).await;
    wait_for(|| h.controller.speech_activity()).await;

    h.capture.emit(vec![0.0; 256]).await;
    wait_for(|| !h.controller.speech_activity()).await;

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn transcript_assembles_per_turn_user_before_model() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport
        .emit(InboundEvent::TranscriptDelta {
            role: Role::User,
            text: "Hel".to_string(),
        })
        .await;
    h.transport
        .emit(InboundEvent::TranscriptDelta {
            role: Role::User,
            text: "lo".to_string(),
        })
        .await;
    h.transport
        .emit(InboundEvent::TranscriptDelta {
            role: Role::Model,
            text: "Hi".to_string(),
        })
        .await;
    h.transport.emit(InboundEvent::TurnComplete).await;

    wait_for(|| h.controller.transcript().len() == 2).await;
    let entries = h.controller.transcript();
    assert_eq!(entries[0].role, Role::User);
    assert_eq!(entries[0].text, "Hello");
    assert_eq!(entries[1].role, Role::Model);
    assert_eq!(entries[1].text, "Hi");

    // A turn with no fragments emits nothing.
    h.transport.emit(InboundEvent::TurnComplete).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.controller.transcript().len(), 2);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn partial_turn_is_discarded_on_stop() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport
        .emit(InboundEvent::TranscriptDelta {
            role: Role::Model,
            text: "never finish".to_string(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.controller.stop().await.unwrap();
    assert!(h.controller.transcript().is_empty());
}

#[tokio::test]
async fn inbound_chunks_play_and_barge_in_silences() {
    let h = harness();
    h.controller.start().await.unwrap();

    // 100ms of audio at 24 kHz.
    let samples: Vec<i16> = vec![1000; 2400];
    h.transport.emit(audio_chunk_event(&samples)).await;
    h.transport.emit(audio_chunk_event(&samples)).await;

    wait_for(|| h.controller.is_speaking()).await;
    wait_for(|| h.sink.committed.lock().unwrap().len() == 2).await;

    // Back-to-back on the output timeline.
    let committed = h.sink.committed.lock().unwrap().clone();
    assert_eq!(committed[0].0, Duration::ZERO);
    assert_eq!(committed[1].0, Duration::from_millis(100));

    h.transport.emit(InboundEvent::Interrupted).await;
    wait_for(|| !h.controller.is_speaking()).await;
    assert!(h.sink.stop_calls.load(Ordering::SeqCst) >= 1);

    // The next chunk schedules at the earliest possible time, not after the
    // stale timeline.
    h.transport.emit(audio_chunk_event(&samples)).await;
    wait_for(|| h.sink.committed.lock().unwrap().len() == 3).await;
    let committed = h.sink.committed.lock().unwrap().clone();
    assert_eq!(committed[2].0, Duration::ZERO);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn undecodable_chunk_is_skipped() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport
        .emit(InboundEvent::AudioChunk {
            data: "@@not-base64@@".to_string(),
            mime_format: pcm_mime_format(24000),
        })
        .await;
    h.transport
        .emit(audio_chunk_event(&vec![500i16; 2400]))
        .await;

    // Only the good chunk reaches the sink; the bad one never stalls playback.
    wait_for(|| h.sink.committed.lock().unwrap().len() == 1).await;
    assert_eq!(h.controller.stats().chunks_scheduled, 1);

    h.controller.stop().await.unwrap();
}

#[tokio::test]
async fn stop_silences_playback_immediately() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.transport
        .emit(audio_chunk_event(&vec![1000i16; 24000]))
        .await;
    wait_for(|| h.controller.is_speaking()).await;

    h.controller.stop().await.unwrap();
    assert!(!h.controller.is_speaking());
    assert!(h.sink.stop_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn stats_reflect_session_activity() {
    let h = harness();
    h.controller.start().await.unwrap();

    h.capture.emit(vec![0.1; 64]).await;
    h.transport.emit(audio_chunk_event(&vec![1i16; 240])).await;
    h.transport
        .emit(InboundEvent::TranscriptDelta {
            role: Role::User,
            text: "hi".to_string(),
        })
        .await;
    h.transport.emit(InboundEvent::TurnComplete).await;

    wait_for(|| {
        let stats = h.controller.stats();
        stats.frames_captured == 1 && stats.chunks_scheduled == 1 && stats.transcript_entries == 1
    })
    .await;

    let stats = h.controller.stats();
    assert_eq!(stats.state, SessionState::Connected);
    assert!(stats.started_at.is_some());

    h.controller.stop().await.unwrap();
}

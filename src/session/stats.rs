use chrono::{DateTime, Utc};
use serde::Serialize;

use super::controller::SessionState;

/// Statistics snapshot for a live voice session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Current state of the session state machine
    pub state: SessionState,

    /// When the session was started, if it ever was
    pub started_at: Option<DateTime<Utc>>,

    /// Seconds since the session started
    pub duration_secs: f64,

    /// Capture frames pulled from the microphone
    pub frames_captured: u64,

    /// Outbound packets evicted because the transport fell behind
    pub packets_dropped: u64,

    /// Inbound audio chunks scheduled for playback
    pub chunks_scheduled: u64,

    /// Finalized transcript entries
    pub transcript_entries: usize,
}

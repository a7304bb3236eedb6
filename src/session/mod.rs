//! Live voice session management
//!
//! This module provides the `SessionController` abstraction that manages:
//! - Microphone capture and per-frame speech activity
//! - Outbound packet encoding and transport send ordering
//! - Inbound event dispatch (playback, transcription, interruption)
//! - The session connection state machine and idempotent teardown

mod config;
pub mod controller;
mod stats;
mod transcript;

pub use config::{SessionConfig, VoicePersona};
pub use controller::{SessionController, SessionState};
pub use stats::SessionStats;
pub use transcript::{TranscriptAggregator, TranscriptEntry};

use serde::{Deserialize, Serialize};

use crate::audio::CaptureConfig;

/// Voice personas the model endpoint can synthesize with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoicePersona {
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
}

impl VoicePersona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
        }
    }
}

/// Configuration for a live voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unique session identifier
    pub session_id: String,

    /// Voice persona for synthesized responses
    pub voice: VoicePersona,

    /// System instruction sent with session setup
    pub system_instruction: String,

    /// Request transcription of captured user speech
    pub transcribe_input: bool,

    /// Request transcription of synthesized model speech
    pub transcribe_output: bool,

    /// Capture-side settings (rate, frame size, speech threshold)
    pub capture: CaptureConfig,

    /// Playback sample rate in Hz (the rate the model synthesizes at)
    pub output_sample_rate: u32,

    /// Bound on packets buffered between capture and the transport
    pub outbound_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            voice: VoicePersona::Puck,
            system_instruction: String::new(),
            transcribe_input: true,
            transcribe_output: true,
            capture: CaptureConfig::default(),
            output_sample_rate: 24000,
            outbound_queue_capacity: 32,
        }
    }
}

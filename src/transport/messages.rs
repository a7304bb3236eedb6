use serde::{Deserialize, Serialize};

/// Speaker role attached to transcript fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Messages sent to the model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Session setup, sent once immediately after the socket opens.
    Setup {
        voice: String,
        system_instruction: String,
        transcribe_input: bool,
        transcribe_output: bool,
    },
    /// One captured audio packet.
    Audio {
        /// Base64-encoded 16-bit little-endian PCM
        data: String,
        mime_format: String,
    },
}

/// Events delivered by the model endpoint, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Incremental transcript text for one speaker role.
    TranscriptDelta { role: Role, text: String },
    /// Synthesized audio to play.
    AudioChunk {
        /// Base64-encoded 16-bit little-endian PCM
        data: String,
        mime_format: String,
    },
    /// The current conversational turn is complete.
    TurnComplete,
    /// The user started speaking over model audio; silence immediately.
    Interrupted,
    /// The remote session failed.
    Error { message: String },
    /// The remote session ended normally.
    Closed,
}

/// Format tag for outbound capture packets.
pub fn pcm_mime_format(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

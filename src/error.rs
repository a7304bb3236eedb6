use thiserror::Error;

/// Errors that can end or refuse a live session.
///
/// Per-event problems (a malformed inbound message, an audio chunk that fails
/// to decode) are recovered locally by the component that sees them; only the
/// variants here escalate to the session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("failed to open transport: {0}")]
    TransportOpenFailed(String),

    #[error("failed to send on transport: {0}")]
    TransportSendFailed(String),

    #[error("session already active")]
    AlreadyActive,

    #[error("session stopped during startup")]
    Cancelled,
}

/// Errors raised while decoding inbound audio payloads.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length {0}, expected 16-bit frames")]
    OddLength(usize),
}

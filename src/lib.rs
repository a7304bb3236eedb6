pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod transport;

pub use audio::{
    CaptureConfig, CaptureFrame, CaptureSource, CpalSink, CpalSinkFactory, MicSource, OutputSink,
    OutputSinkFactory, PlaybackScheduler,
};
pub use config::Config;
pub use error::{DecodeError, SessionError};
pub use session::{
    SessionConfig, SessionController, SessionState, SessionStats, TranscriptEntry, VoicePersona,
};
pub use transport::{InboundEvent, OutboundMessage, Role, Transport, WsTransport};

pub mod capture;
pub mod pcm;
pub mod playback;

pub use capture::{CaptureConfig, CaptureFrame, CaptureSource, MicSource};
pub use playback::{
    CpalSink, CpalSinkFactory, OutputSink, OutputSinkFactory, PlaybackScheduler, ScheduledChunk,
};

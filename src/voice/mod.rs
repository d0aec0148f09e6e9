//! Voice command pipeline
//!
//! Capture (JACK callback, real-time safe) -> resample -> streaming
//! recognizer -> wake gate -> alias resolution -> command dispatch.

pub mod aliases;
pub mod capture;
pub mod gate;
pub mod pipeline;
pub mod recognizer;
pub mod resample;

pub use aliases::{normalize, AliasTable};
pub use capture::{
    capture_pair, CaptureConsumer, CaptureSink, RecorderTap, CHUNK_FRAMES, DEFAULT_QUEUE_CHUNKS,
};
pub use gate::{ListeningWindow, WakeGate, DEFAULT_WINDOW};
pub use pipeline::{CommandDispatcher, PipelineStats, VoiceCommandMsg, VoicePipeline};
pub use recognizer::{
    RecognizerResult, ScriptedRecognizer, SocketRecognizer, StreamingRecognizer,
};
pub use resample::StreamResampler;

//! Call Engine Module - Anrufsteuerung und Audio
//!
//! Dieses Modul verwaltet:
//! - Anruf-Zustandsautomat (open / result / error)
//! - Laufende Verhandlungen mit Timeout
//! - Rahmung der Audio-Frames für den Text-Kanal
//! - Opus Encoding/Decoding
//! - Audio Capture und Playback im Echtzeit-Callback

mod audio;
mod codec;
mod engine;
pub mod framer;
mod pending;
mod session;

pub use audio::{
    spawn_frame_sender, AudioDevice, AudioError, AudioPipeline, FrameQueues, PipelineStats,
    CHANNELS, FRAME_SIZE, PLAYBACK_WAIT, QUEUE_CAPACITY, SAMPLE_RATE, TICK_PERIOD,
};
pub use codec::{CodecError, VoiceCodec, MAX_PACKET_SIZE, OPUS_BITRATE};
pub use engine::{
    CallEngine, CallError, CallEvent, CallState, EndReason, EngineConfig, CALL_TIMEOUT,
};
pub use framer::FramingError;
pub use pending::{CallDirection, CallOutcome, PendingCall, PendingCallRegistry};
pub use session::Session;

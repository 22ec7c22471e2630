mod noop;
pub mod whisper;

pub use noop::NoopTranscriber;
pub use whisper::{WhisperConfig, WhisperSidecar};

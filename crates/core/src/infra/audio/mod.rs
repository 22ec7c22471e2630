pub mod enhancer;
pub mod vad;

pub use enhancer::{AudioEnhancer, EnhanceError, PassthroughEnhancer};
pub use vad::{probe, AudioProbe, ProbeError};

pub mod buffer;
pub mod retention;

pub use buffer::{pcm_to_wav_bytes, encode_component, AudioBuffer};
pub use retention::RetentionPolicy;

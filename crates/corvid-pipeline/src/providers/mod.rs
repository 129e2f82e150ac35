//! Concrete provider adapters.
//!
//! HTTP adapters for speech providers exposing a transcribe/synthesize REST
//! surface. Anything implementing the core traits plugs in the same way.

mod http_stt;
mod http_tts;

pub use http_stt::{HttpStt, HttpSttConfig};
pub use http_tts::{HttpTts, HttpTtsConfig};

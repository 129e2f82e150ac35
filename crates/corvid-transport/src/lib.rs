//! WebRTC transport adapter.
//!
//! Bridges one peer (browser or robot) into the pipeline: a bidirectional
//! Opus audio path, trickle ICE signalling, and an ordered reliable data
//! channel carrying JSON-lines metadata. Audio never flows on the data
//! channel.

mod channel;
mod codec;
mod webrtc;

pub use channel::{PeerMessage, TtsState};
pub use codec::{OpusDecoder, OpusEncoder, Packetizer};
pub use webrtc::{
    IceCandidate, TransportEvent, WebRtcConfig, WebRtcState, WebRtcTransport, TRANSPORT_RATE,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("unsupported codec after negotiation: {0}")]
    UnsupportedCodec(String),

    #[error("data channel error: {0}")]
    DataChannel(String),

    #[error("session closed")]
    SessionClosed,

    #[error("internal transport error: {0}")]
    Internal(String),
}

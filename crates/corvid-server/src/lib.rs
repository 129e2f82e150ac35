//! Signalling server and per-peer session lifecycle.
//!
//! Two idempotent signalling operations (`POST /offer`, `PATCH /offer`) plus
//! a health document. A session is created on transport-accept, wires the
//! pipeline graph to the peer connection, and is destroyed on transport
//! close or fatal error.

pub mod http;
pub mod providers;
pub mod session;
pub mod state;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("session error: {0}")]
    Session(String),

    #[error("too many sessions")]
    Capacity,

    #[error("bad offer: {0}")]
    BadOffer(String),

    #[error("initialisation error: {0}")]
    Init(String),

    #[error(transparent)]
    Transport(#[from] corvid_transport::TransportError),

    #[error(transparent)]
    Config(#[from] corvid_config::ConfigError),
}

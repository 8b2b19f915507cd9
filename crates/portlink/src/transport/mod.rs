//! Channel adapters.
//!
//! - **native**: a spawned helper process spoken to over stdio with
//!   native-messaging frames
//! - **worker**: a dedicated OS thread running a peer over an in-memory pair

pub mod native;
pub mod worker;

use std::io;

/// Failure to establish or pump a channel. Callers of a session only ever see
/// `Disconnected`; the cause is logged.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn {peer}: {source}")]
    Spawn {
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("{peer} has no piped {stream}")]
    MissingStdio { peer: String, stream: &'static str },

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("peer unavailable: {0}")]
    Unavailable(String),
}

//! portlink: correlated request/response over unordered message channels.
//!
//! A [`Session`] turns a raw bidirectional channel into awaitable calls with
//! per-request timeouts, a version handshake, progress streaming and reverse
//! calls from the peer. [`peer::serve`] is the other end. Channels come from a
//! [`ChannelFactory`]: a spawned native-messaging host or a worker thread.

pub mod bridge;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod handshake;
pub mod mecab;
pub mod peer;
pub mod pending;
pub mod router;
pub mod session;
pub mod transport;
mod version;

pub use bridge::channel::{Channel, ChannelFactory, ChannelSender};
pub use config::SessionConfig;
pub use error::{Result, RpcError, SerializedError};
pub use peer::{PeerOptions, RequestContext, RequestHandler, serve};
pub use pending::ProgressSink;
pub use router::{ReverseCallHandler, ReverseCallRegistry};
pub use session::{Session, SessionId, SessionState};
pub use transport::TransportError;
pub use version::{PORTLINK_VERSION, VersionInfo};

//! Message bridge between this side and a peer.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, Event) decoded once at the boundary
//! - **codec**: Native-messaging framing codec for AsyncRead/AsyncWrite
//! - **channel**: The abstract channel contract and its factory trait

pub mod channel;
pub mod codec;
pub mod protocol;

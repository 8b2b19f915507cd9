//! Native-messaging framing codec.
//!
//! Each frame is a 4-byte little-endian length followed by UTF-8 JSON.
//! Uses LengthDelimitedCodec for framing + serde_json for serialization, so it
//! works over any AsyncRead/AsyncWrite (child stdio, duplex pipes, sockets).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest message a native host may send to the extension.
pub const HOST_MESSAGE_LIMIT: usize = 1024 * 1024;

/// Largest message the extension may send to a native host.
pub const CLIENT_MESSAGE_LIMIT: usize = 64 * 1024 * 1024;

/// Codec that frames messages with a little-endian length prefix and
/// serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(CLIENT_MESSAGE_LIMIT)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .little_endian()
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

/// A well-framed body that is not valid JSON decodes to `Some(Err(_))`, so a
/// reader can drop that one message and keep the stream. Only framing and IO
/// failures (including oversized frames) are stream errors.
impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self
            .inner
            .decode(src)?
            .map(|bytes| serde_json::from_slice(&bytes)))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > self.max_frame_length / 2 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                limit_kb = self.max_frame_length / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

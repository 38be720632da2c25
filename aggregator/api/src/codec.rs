use crate::{AggregatorMessage, CollectorMessage};
use bytes::BytesMut;
use prost::Message;
use std::{io, marker::PhantomData};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. Snapshots of large clusters are the
/// biggest messages on the wire.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Length-delimited prost framing for one direction of a collector link.
///
/// `E` is the message type written, `D` the type read; the two aliases below
/// fix the directions for each side of the stream.
#[derive(Debug)]
pub struct WireCodec<E, D> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

/// Codec for the aggregator side of a collector link.
pub type ServerCodec = WireCodec<AggregatorMessage, CollectorMessage>;

/// Codec for the collector side; also drives scripted collectors in tests.
pub type ClientCodec = WireCodec<CollectorMessage, AggregatorMessage>;

impl<E, D> WireCodec<E, D> {
    pub fn new() -> Self {
        let inner = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .length_field_type::<u32>()
            .new_codec();
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for WireCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Message, D: Message + Default> Encoder<E> for WireCodec<E, D> {
    type Error = CodecError;

    fn encode(&mut self, message: E, dst: &mut BytesMut) -> Result<(), CodecError> {
        let buf = message.encode_to_vec();
        self.inner.encode(buf.into(), dst)?;
        Ok(())
    }
}

impl<E: Message, D: Message + Default> Decoder for WireCodec<E, D> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecError> {
        let frame = match self.inner.decode(src)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        Ok(Some(D::decode(frame.freeze())?))
    }
}

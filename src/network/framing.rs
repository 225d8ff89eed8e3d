//! Length-prefixed bincode frames over any async byte stream.

use bincode::{Decode, Encode};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::RpcError;
use crate::message::{decode_frame, encode_frame};

/// Upper bound for one frame; a GET_RANGE answer is the largest message.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub struct FrameSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
        }
    }

    pub async fn send<T: Encode>(&mut self, value: &T) -> Result<(), RpcError> {
        let bytes = encode_frame(value)?;
        self.inner
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| RpcError::Network(format!("Send error: {}", e)))
    }
}

pub struct FrameStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
        }
    }

    /// Next frame, `None` once the peer closed the stream.
    pub async fn recv<T: Decode<()>>(&mut self) -> Result<Option<T>, RpcError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => decode_frame(&bytes[..]).map(Some),
            Some(Err(e)) => Err(RpcError::Network(format!("Read error: {}", e))),
            None => Ok(None),
        }
    }
}

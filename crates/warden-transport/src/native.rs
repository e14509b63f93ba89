//! Length-prefixed byte-stream transport.
//!
//! Native messaging hosts exchange frames over stdin/stdout: a 4-byte
//! little-endian length followed by that many bytes of UTF-8 JSON.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::adapter::{FrameSink, FrameSource, InboundFrame};
use crate::errors::TransportError;

const LEN_PREFIX: usize = 4;

/// Default frame cap (10 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Codec for 4-byte little-endian length-prefixed text frames.
#[derive(Clone, Copy, Debug)]
pub struct NativeMessagingCodec {
    max_frame_bytes: usize,
}

impl NativeMessagingCodec {
    /// Codec rejecting frames larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for NativeMessagingCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for NativeMessagingCodec {
    type Item = String;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, TransportError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let body = src.split_to(len);
        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

impl Encoder<String> for NativeMessagingCodec {
    type Error = TransportError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = item.len();
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        let prefix = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
            len,
            max: self.max_frame_bytes,
        })?;
        dst.reserve(LEN_PREFIX + len);
        dst.put_u32_le(prefix);
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Sending half of a native port. Frames are written by a background task.
#[derive(Clone, Debug)]
pub struct NativeSink {
    tx: mpsc::UnboundedSender<String>,
    max_frame_bytes: usize,
}

/// Receiving half of a native port.
pub struct NativeSource<R> {
    frames: FramedRead<R, NativeMessagingCodec>,
}

impl FrameSink for NativeSink {
    fn send(&self, text: String) -> Result<(), TransportError> {
        if text.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len: text.len(),
                max: self.max_frame_bytes,
            });
        }
        self.tx.send(text).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl<R> FrameSource for NativeSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<InboundFrame> {
        match self.frames.next().await? {
            Ok(text) => Some(InboundFrame::direct(text)),
            Err(e) => {
                // A bad prefix desynchronizes the stream; nothing after it can be trusted.
                warn!(error = %e, "native port read failed, closing");
                None
            }
        }
    }
}

/// Build a native port over a reader/writer pair (usually stdin/stdout).
///
/// Must be called inside a Tokio runtime: the writer half runs as a spawned
/// task that exits once every [`NativeSink`] clone is dropped.
pub fn native_port<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> (NativeSink, NativeSource<R>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let codec = NativeMessagingCodec::new(max_frame_bytes);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut framed = FramedWrite::new(writer, codec);

    let _ = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = framed.send(text).await {
                warn!(error = %e, "native port write failed");
                break;
            }
        }
        debug!("native port writer stopped");
    });

    let sink = NativeSink {
        tx,
        max_frame_bytes,
    };
    let source = NativeSource {
        frames: FramedRead::new(reader, codec),
    };
    (sink, source)
}

//! Length-prefixed JSON frames over any byte stream.

use super::Message;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

fn codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

pub struct MessageSink<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> MessageSink<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec(max_frame_bytes)),
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let payload = serde_json::to_vec(msg).context("failed to encode message")?;
        self.inner
            .send(Bytes::from(payload))
            .await
            .with_context(|| format!("failed to send {}", msg.name()))
    }

    /// Flushes pending frames and shuts the write half down.
    pub async fn close(&mut self) -> Result<()> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

pub struct MessageStream<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> MessageStream<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, codec(max_frame_bytes)),
        }
    }

    /// Next message, or `None` once the peer closes the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match self.inner.next().await {
            Some(Ok(bytes)) => {
                let msg = serde_json::from_slice(&bytes).context("failed to decode message")?;
                Ok(Some(msg))
            }
            Some(Err(err)) => Err(err).context("failed to read frame"),
            None => Ok(None),
        }
    }
}

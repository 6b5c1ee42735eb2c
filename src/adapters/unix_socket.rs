//! Unix Socket Transport
//!
//! Length-delimited frames, one JSON-encoded [`Message`] per frame. The
//! framing helpers are shared with the server's connection tasks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace};

use crate::domain::{Message, Transport};
use crate::error::{Error, Result};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framed message stream over `S`
pub type MessageFrames<S> = Framed<S, LengthDelimitedCodec>;

pub fn message_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Write one message as a frame
pub async fn send_frame<S>(frames: &mut MessageFrames<S>, message: &Message) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    trace!(kind = message.kind(), len = payload.len(), "Sending frame");
    frames.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Read the next message; `None` once the peer has closed the stream
pub async fn recv_frame<S>(frames: &mut MessageFrames<S>) -> Result<Option<Message>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frames.next().await {
        None => Ok(None),
        Some(frame) => {
            let frame = frame?;
            Ok(Some(serde_json::from_slice(&frame)?))
        }
    }
}

/// Client side of the server socket
pub struct UnixTransport {
    frames: MessageFrames<UnixStream>,
    path: PathBuf,
}

impl UnixTransport {
    /// Connect to the server listening at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).await.map_err(|e| {
            Error::TransportFailure(format!("connect to {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Connected to server");
        Ok(Self {
            frames: Framed::new(stream, message_codec()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn transport_error(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::TransportFailure(io.to_string()),
        other => other,
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn send(&mut self, message: Message) -> Result<()> {
        send_frame(&mut self.frames, &message)
            .await
            .map_err(transport_error)
    }

    async fn receive(&mut self) -> Result<Message> {
        recv_frame(&mut self.frames)
            .await
            .map_err(transport_error)?
            .ok_or_else(|| Error::TransportFailure("server closed the connection".into()))
    }
}

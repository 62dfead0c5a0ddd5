//! Length-delimited JSON framing shared by greet and secure connections.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON body of at
//! most `MAX_FRAME` bytes.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use murmur_core::wire::MAX_FRAME;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("connection closed")]
    Closed,

    #[error("timed out")]
    TimedOut,
}

impl FrameError {
    /// True when the connection itself is gone, as opposed to a bad frame.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Closed | FrameError::TimedOut => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::NotConnected
            ),
            FrameError::Json(_) | FrameError::TooLarge(_) => false,
        }
    }
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_framed(io)
}

pub async fn write_json<S, T>(sink: &mut S, value: &T) -> Result<(), FrameError>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME {
        return Err(FrameError::TooLarge(body.len()));
    }
    sink.send(Bytes::from(body)).await?;
    Ok(())
}

pub async fn read_json<S, T>(stream: &mut S) -> Result<T, FrameError>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(bytes)) => Ok(serde_json::from_slice(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(FrameError::Closed),
    }
}

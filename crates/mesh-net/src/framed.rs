//! Length-prefixed frames over an async stream.
//!
//! A peer frame is a u32 big-endian length prefix followed by that many
//! opaque bytes. The socket splits into one reader and one writer half,
//! enforcing the single-reader/single-writer discipline per direction.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use mesh_core::wire::MAX_PEER_FRAME;
use mesh_core::NetError;

/// A framed socket, pre-split. Construct with [`FramedSocket::new`], use
/// for the handshake, then [`FramedSocket::split`] for the session loops.
pub struct FramedSocket<S> {
    stream: S,
    remote: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedSocket<S> {
    pub fn new(stream: S, remote: SocketAddr) -> Self {
        Self { stream, remote }
    }

    /// Remote endpoint of the underlying connection.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn read_frame(&mut self) -> Result<Bytes, NetError> {
        read_frame_from(&mut self.stream).await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), NetError> {
        write_frame_to(&mut self.stream, payload).await
    }

    /// Split into exclusive read and write halves.
    pub fn split(self) -> (FrameReader<S>, FrameWriter<S>) {
        let (r, w) = tokio::io::split(self.stream);
        (
            FrameReader {
                inner: r,
                remote: self.remote,
            },
            FrameWriter {
                inner: w,
                remote: self.remote,
            },
        )
    }
}

/// The exclusive read half.
pub struct FrameReader<S> {
    inner: ReadHalf<S>,
    remote: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite> FrameReader<S> {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Read one frame. A clean EOF before the length prefix surfaces as
    /// `Ok(None)`: the remote half-closed and the session should begin
    /// disconnecting.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, NetError>
    where
        S: Unpin,
    {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(NetError::Transport(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_PEER_FRAME {
            return Err(NetError::Protocol(format!(
                "frame of {len} bytes exceeds the maximum"
            )));
        }
        let mut payload = BytesMut::zeroed(len);
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(NetError::Transport)?;
        Ok(Some(payload.freeze()))
    }
}

/// The exclusive write half.
pub struct FrameWriter<S> {
    inner: WriteHalf<S>,
    remote: SocketAddr,
}

impl<S: AsyncRead + AsyncWrite> FrameWriter<S> {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), NetError>
    where
        S: Unpin,
    {
        write_frame_to(&mut self.inner, payload).await
    }

    pub async fn shutdown(&mut self) -> Result<(), NetError>
    where
        S: Unpin,
    {
        self.inner.shutdown().await.map_err(NetError::Transport)
    }
}

async fn read_frame_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Bytes, NetError> {
    let len = stream.read_u32().await.map_err(NetError::Transport)? as usize;
    if len > MAX_PEER_FRAME {
        return Err(NetError::Protocol(format!(
            "frame of {len} bytes exceeds the maximum"
        )));
    }
    let mut payload = BytesMut::zeroed(len);
    stream
        .read_exact(&mut payload)
        .await
        .map_err(NetError::Transport)?;
    Ok(payload.freeze())
}

async fn write_frame_to<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), NetError> {
    if payload.len() > MAX_PEER_FRAME {
        return Err(NetError::Protocol(format!(
            "frame of {} bytes exceeds the maximum",
            payload.len()
        )));
    }
    stream
        .write_u32(payload.len() as u32)
        .await
        .map_err(NetError::Transport)?;
    stream.write_all(payload).await.map_err(NetError::Transport)?;
    stream.flush().await.map_err(NetError::Transport)
}

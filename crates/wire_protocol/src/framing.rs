// Each message is a 4-byte big-endian payload length followed by the
// serialized record. The length prefix is reset per message, so a receiver
// can always resynchronize at a frame boundary.

use bincode::Options;
use byteorder::{BE, ByteOrder};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_LEN;

const LEN_PREFIX_LEN: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("error encoding message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("error decoding message: {0}")]
    Decode(#[source] bincode::Error),
    #[error("stream closed by peer")]
    Eof,
    #[error("read timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Timeout)
    }
}

fn bopts() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

pub(crate) fn map_eof(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Eof
    } else {
        WireError::Io(e)
    }
}

pub(crate) fn encode_frame<M: Serialize>(out: &mut Vec<u8>, msg: &M) -> Result<(), WireError> {
    let payload = bopts().serialize(msg).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut len = [0u8; 4];
    BE::write_u32(&mut len, payload.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(&payload);
    Ok(())
}

/// Writes one framed message and flushes. Flushing at the message boundary
/// is what lets the sockets keep Nagle enabled.
pub async fn send_msg<M: Serialize>(
    w: &mut (impl AsyncWrite + Unpin),
    msg: &M,
) -> Result<(), WireError> {
    let mut buf = Vec::new();
    encode_frame(&mut buf, msg)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// One-shot frame read with no deadline, for streams that are discarded
/// on failure (the hello). Not resumable: an interrupted read leaves the
/// stream desynchronized.
pub(crate) async fn recv_msg<M: DeserializeOwned>(
    r: &mut (impl AsyncRead + Unpin),
) -> Result<M, WireError> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len).await.map_err(map_eof)?;
    let len = BE::read_u32(&len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(map_eof)?;
    bopts().deserialize(&payload).map_err(WireError::Decode)
}

/// Receive state for one stream. Bytes already read persist here across a
/// timed-out call, so the next call resumes the same frame instead of
/// desynchronizing: the timeout wraps each individual `read` (a single
/// read is cancellation-safe, a sequence of them is not), and reads never
/// go past the frame the length prefix declares.
pub struct ReadBuf {
    buf: Vec<u8>,
    filled: usize,
}

impl ReadBuf {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            filled: 0,
        }
    }

    async fn fill_to(
        &mut self,
        r: &mut (impl AsyncRead + Unpin),
        target: usize,
        timeout: std::time::Duration,
    ) -> Result<(), WireError> {
        if self.buf.len() < target {
            self.buf.resize(target, 0);
        }
        while self.filled < target {
            let read = tokio::time::timeout(timeout, r.read(&mut self.buf[self.filled..target]));
            match read.await {
                Ok(Ok(0)) => return Err(WireError::Eof),
                Ok(Ok(n)) => self.filled += n,
                Ok(Err(e)) => return Err(WireError::Io(e)),
                Err(_) => return Err(WireError::Timeout),
            }
        }
        Ok(())
    }

    /// Reads one framed message, giving up with [`WireError::Timeout`]
    /// when a single read stalls for `timeout`. A timed-out call leaves
    /// the stream usable; whatever arrived stays buffered for the next
    /// call.
    pub async fn recv_msg_timeout<M: DeserializeOwned>(
        &mut self,
        r: &mut (impl AsyncRead + Unpin),
        timeout: std::time::Duration,
    ) -> Result<M, WireError> {
        self.fill_to(r, LEN_PREFIX_LEN, timeout).await?;
        let len = BE::read_u32(&self.buf[..LEN_PREFIX_LEN]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }
        self.fill_to(r, LEN_PREFIX_LEN + len, timeout).await?;
        // The frame is consumed either way; an undecodable payload must
        // not be re-decoded forever.
        let msg = bopts()
            .deserialize(&self.buf[LEN_PREFIX_LEN..LEN_PREFIX_LEN + len])
            .map_err(WireError::Decode);
        self.buf.clear();
        self.filled = 0;
        msg
    }
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self::new()
    }
}

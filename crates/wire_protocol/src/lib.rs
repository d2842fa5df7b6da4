// Wire protocol between two spate nodes: a connection is a triple of TCP
// sockets (notice, request, data), each carrying length-prefixed serialized
// messages. Large piece transfers on the data stream never head-of-line
// block the small latency-sensitive notices and requests.

mod framing;
pub mod tracker;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use libspate_core::{FileId, Filter, Piece, PieceSpec};

pub use framing::{ReadBuf, WireError, send_msg};

pub const HELLO_MAGIC: [u8; 4] = *b"SPTE";
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a single frame: one piece of the canonical size plus
/// generous headroom for the enclosing record.
pub const MAX_FRAME_LEN: usize = 4 << 20;

/// Which of a connection's three sockets a stream is. The numeric value is
/// what travels in the per-socket hello.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[repr(u8)]
pub enum StreamKind {
    Notice = 0,
    Request = 1,
    Data = 2,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Notice, StreamKind::Request, StreamKind::Data];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl TryFrom<u8> for StreamKind {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(StreamKind::Notice),
            1 => Ok(StreamKind::Request),
            2 => Ok(StreamKind::Data),
            other => Err(other),
        }
    }
}

/// Written by the connecting side on each freshly opened socket. The
/// accepting side groups sockets by `(server_addr, connection_id)` and
/// promotes the triple to a connection once all three kinds have arrived.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct StreamHello {
    pub connection_id: u64,
    pub kind: StreamKind,
    /// The connecting node's own server address, so the accepting side
    /// knows who it is peered with (and can exclude it from its own
    /// outbound candidates).
    pub server_addr: SocketAddr,
}

/// Messages of the notice stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum NoticeMessage {
    /// Sent once at stream start, and again whenever the local filter
    /// shrinks.
    HaveFilter(Filter),
    HavePiece(PieceSpec),
    FileRemoved(FileId),
}

/// Messages of the request stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum RequestMessage {
    RequestPiece(PieceSpec),
}

/// Messages of the data stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum DataMessage {
    PieceData(Piece),
}

#[derive(thiserror::Error, Debug)]
pub enum HelloError {
    #[error("bad hello magic {0:?}: not a spate server")]
    BadMagic([u8; 4]),
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl HelloError {
    /// Whether the remote end should be marked an invalid server rather
    /// than a transiently failed one.
    pub fn is_invalid_server(&self) -> bool {
        match self {
            HelloError::BadMagic(_) | HelloError::BadVersion(_) => true,
            HelloError::Wire(w) => matches!(w, WireError::Eof | WireError::Decode(_)),
        }
    }
}

pub async fn write_hello(
    w: &mut (impl tokio::io::AsyncWrite + Unpin),
    hello: &StreamHello,
) -> Result<(), WireError> {
    use tokio::io::AsyncWriteExt;
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&HELLO_MAGIC);
    buf.push(WIRE_VERSION);
    framing::encode_frame(&mut buf, hello)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_hello(
    r: &mut (impl tokio::io::AsyncRead + Unpin),
    timeout: std::time::Duration,
) -> Result<StreamHello, HelloError> {
    tokio::time::timeout(timeout, async {
        use tokio::io::AsyncReadExt;
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).await.map_err(framing::map_eof)?;
        if magic != HELLO_MAGIC {
            return Err(HelloError::BadMagic(magic));
        }
        let version = r.read_u8().await.map_err(framing::map_eof)?;
        if version != WIRE_VERSION {
            return Err(HelloError::BadVersion(version));
        }
        // One-shot read: a socket that fails its hello is discarded, so
        // resumability does not matter here.
        Ok(framing::recv_msg(r).await?)
    })
    .await
    .map_err(|_| HelloError::Wire(WireError::Timeout))?
}

/// Stream socket options: keepalive on, linger off. Nagle is left alone;
/// senders flush at message boundaries.
pub fn apply_socket_options(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_linger(None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspate_core::{ArchivePath, ArchiveTime, FileInfo};
    use std::time::Duration;

    fn spec() -> PieceSpec {
        FileInfo::new(
            FileId {
                path: ArchivePath::new("DATA/a").unwrap(),
                time: ArchiveTime::from_millis(42),
            },
            300_000,
            131072,
            60,
        )
        .unwrap()
        .spec(2)
        .unwrap()
    }

    #[tokio::test]
    async fn test_notice_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let mut rb = ReadBuf::new();
        let sent = NoticeMessage::HavePiece(spec());
        send_msg(&mut a, &sent).await.unwrap();
        send_msg(&mut a, &NoticeMessage::HaveFilter(Filter::Everything))
            .await
            .unwrap();
        let got: NoticeMessage = rb.recv_msg_timeout(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, sent);
        let got: NoticeMessage = rb.recv_msg_timeout(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, NoticeMessage::HaveFilter(Filter::Everything));
    }

    #[tokio::test]
    async fn test_piece_data_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let mut rb = ReadBuf::new();
        let spec = spec();
        let data = vec![7u8; spec.len() as usize];
        let sent = DataMessage::PieceData(Piece::new(spec, data).unwrap());
        send_msg(&mut a, &sent).await.unwrap();
        let got: DataMessage = rb.recv_msg_timeout(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn test_recv_timeout_then_delivery() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let mut rb = ReadBuf::new();
        let r = rb
            .recv_msg_timeout::<RequestMessage>(&mut b, Duration::from_millis(20))
            .await;
        assert!(matches!(r, Err(WireError::Timeout)));
        // The stream stays usable after an idle timeout.
        send_msg(&mut a, &RequestMessage::RequestPiece(spec()))
            .await
            .unwrap();
        let got = rb
            .recv_msg_timeout::<RequestMessage>(&mut b, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, RequestMessage::RequestPiece(spec()));
    }

    #[tokio::test]
    async fn test_recv_timeout_mid_frame_keeps_stream_usable() {
        use tokio::io::AsyncWriteExt;
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        let mut rb = ReadBuf::new();

        let mut frame = Vec::new();
        crate::framing::encode_frame(&mut frame, &RequestMessage::RequestPiece(spec())).unwrap();

        // Only the length prefix arrives; the receiver must time out
        // without losing it.
        a.write_all(&frame[..4]).await.unwrap();
        a.flush().await.unwrap();
        let r = rb
            .recv_msg_timeout::<RequestMessage>(&mut b, Duration::from_millis(20))
            .await;
        assert!(matches!(r, Err(WireError::Timeout)));

        // Then part of the payload; still mid-frame, still recoverable.
        a.write_all(&frame[4..10]).await.unwrap();
        a.flush().await.unwrap();
        let r = rb
            .recv_msg_timeout::<RequestMessage>(&mut b, Duration::from_millis(20))
            .await;
        assert!(matches!(r, Err(WireError::Timeout)));

        // The rest of the frame completes the original message, and the
        // following frame decodes cleanly too.
        a.write_all(&frame[10..]).await.unwrap();
        send_msg(&mut a, &RequestMessage::RequestPiece(spec()))
            .await
            .unwrap();
        for _ in 0..2 {
            let got = rb
                .recv_msg_timeout::<RequestMessage>(&mut b, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(got, RequestMessage::RequestPiece(spec()));
        }
    }

    #[tokio::test]
    async fn test_recv_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let mut rb = ReadBuf::new();
        let r = rb
            .recv_msg_timeout::<NoticeMessage>(&mut b, Duration::from_secs(1))
            .await;
        assert!(matches!(r, Err(WireError::Eof)));
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let hello = StreamHello {
            connection_id: 77,
            kind: StreamKind::Data,
            server_addr: "127.0.0.1:4000".parse().unwrap(),
        };
        write_hello(&mut a, &hello).await.unwrap();
        let got = read_hello(&mut b, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, hello);
    }

    #[tokio::test]
    async fn test_hello_bad_magic() {
        let (mut a, mut b) = tokio::io::duplex(256);
        use tokio::io::AsyncWriteExt;
        a.write_all(b"HTTP/1.1 400\r\n\r\n").await.unwrap();
        let err = read_hello(&mut b, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_invalid_server());
    }
}

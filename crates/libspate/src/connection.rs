use std::net::SocketAddr;

use tokio::net::TcpStream;

use libspate_wire_protocol::StreamKind;

/// Identity of a connection between two nodes, ordered by the pair of
/// server addresses. Two peers over the same connection are further told
/// apart by their local filter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ConnectionKey {
    pub local_server: SocketAddr,
    pub remote_server: SocketAddr,
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.local_server, self.remote_server)
    }
}

/// A pair of nodes multiplexed over three TCP sockets, one per stream
/// kind. Ready once all three are present; the peer splits them up.
pub struct Connection {
    pub key: ConnectionKey,
    pub id: u64,
    streams: [TcpStream; 3],
}

impl Connection {
    pub fn new(key: ConnectionKey, id: u64, streams: [TcpStream; 3]) -> Self {
        Self { key, id, streams }
    }

    /// In [`StreamKind::ALL`] order: notice, request, data.
    pub fn into_streams(self) -> [TcpStream; 3] {
        self.streams
    }
}

/// Collects the three sockets of one inbound connection as their hellos
/// arrive, in any order.
pub(crate) struct PendingConnection {
    streams: [Option<TcpStream>; 3],
    pub created: std::time::Instant,
}

impl PendingConnection {
    pub fn new() -> Self {
        Self {
            streams: [None, None, None],
            created: std::time::Instant::now(),
        }
    }

    pub fn insert(&mut self, kind: StreamKind, stream: TcpStream) {
        if self.streams[kind.index()].is_some() {
            tracing::debug!(?kind, "duplicate stream for pending connection, replacing");
        }
        self.streams[kind.index()] = Some(stream);
    }

    pub fn is_ready(&self) -> bool {
        self.streams.iter().all(|s| s.is_some())
    }

    pub fn into_streams(self) -> Option<[TcpStream; 3]> {
        let [a, b, c] = self.streams;
        Some([a?, b?, c?])
    }
}

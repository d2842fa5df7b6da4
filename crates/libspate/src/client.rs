// Outbound half of a node: dials the three sockets of a fresh connection
// to a remote server, introduces each with a hello, and runs a peer over
// the triple until it finishes.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use libspate_core::{Config, Filter};
use libspate_wire_protocol::{StreamHello, StreamKind, apply_socket_options, write_hello};

use crate::clearing_house::ClearingHouse;
use crate::connection::{Connection, ConnectionKey};
use crate::peer::{Peer, PeerCounters, PeerOutcome};

#[derive(Debug, PartialEq, Eq)]
pub enum ClientOutcome {
    /// The remote was a valid server and the exchange ran to completion
    /// (local predicate drained).
    Done,
    Cancelled,
    /// Wrong protocol or closed before the handshake; the server should be
    /// marked invalid.
    InvalidServer,
}

/// Connects to `remote`, runs a peer wanting `filter`, and classifies the
/// ending. I/O failures (including connect refusal) propagate as errors
/// for the caller to translate into tracker reports.
#[allow(clippy::too_many_arguments)]
pub async fn run_client(
    local_server: SocketAddr,
    remote: SocketAddr,
    filter: Filter,
    clearing_house: Arc<ClearingHouse>,
    config: &Config,
    counters: Arc<PeerCounters>,
    cancel: CancellationToken,
) -> anyhow::Result<ClientOutcome> {
    let connection_id: u64 = rand::random();
    let mut streams = Vec::with_capacity(3);
    for kind in StreamKind::ALL {
        let mut stream = tokio::time::timeout(config.socket_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))
            .and_then(|r| r)
            .with_context(|| format!("error connecting {kind:?} stream to {remote}"))?;
        if let Err(e) = apply_socket_options(&stream) {
            debug!("error setting socket options: {e}");
        }
        write_hello(
            &mut stream,
            &StreamHello {
                connection_id,
                kind,
                server_addr: local_server,
            },
        )
        .await
        .with_context(|| format!("error greeting {remote}"))?;
        streams.push(stream);
    }
    let streams: [TcpStream; 3] = streams
        .try_into()
        .map_err(|_| anyhow::anyhow!("bug: expected exactly three streams"))?;

    let connection = Connection::new(
        ConnectionKey {
            local_server,
            remote_server: remote,
        },
        connection_id,
        streams,
    );
    let peer = Peer::with_counters(
        connection,
        filter,
        clearing_house,
        config.socket_timeout,
        true,
        cancel,
        counters,
    );
    match peer.run().await {
        Ok(PeerOutcome::Done) => Ok(ClientOutcome::Done),
        Ok(PeerOutcome::Cancelled) => Ok(ClientOutcome::Cancelled),
        Err(e) if e.is_invalid_server() => {
            debug!(%remote, "not a valid server: {e:#}");
            Ok(ClientOutcome::InvalidServer)
        }
        Err(e) => Err(e.into()),
    }
}

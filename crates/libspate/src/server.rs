// Inbound half of a node. One TCP listener accepts all three sockets of
// each connection; the per-socket hello says which stream a socket carries
// and for which connection, and a completed triple is promoted to a peer.
//
// A source server refuses to want anything (its filter is Nothing); a sink
// server advertises the subscription it is still filling.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, trace};

use libspate_core::{Config, Filter, spawn_utils::spawn};
use libspate_wire_protocol::{StreamHello, apply_socket_options, read_hello};

use crate::clearing_house::ClearingHouse;
use crate::connection::{Connection, ConnectionKey, PendingConnection};
use crate::peer::Peer;

/// Unpaired sockets older than this are swept out.
const PENDING_EXPIRY: Duration = Duration::from_secs(60);

pub struct Server {
    local_addr: SocketAddr,
    local_filter: Filter,
    exit_when_done: bool,
    socket_timeout: Duration,
    clearing_house: Arc<ClearingHouse>,
    pending: Mutex<HashMap<(SocketAddr, u64), PendingConnection>>,
}

/// Binds within the configured port range; an absent range lets the OS
/// assign a port.
pub async fn bind_listener(
    listen_ip: IpAddr,
    config: &Config,
) -> anyhow::Result<(TcpListener, SocketAddr)> {
    let listener = match config.server_port_range {
        None => TcpListener::bind((listen_ip, 0))
            .await
            .context("error binding server listener")?,
        Some((lo, hi)) => {
            let mut bound = None;
            let mut last_err = None;
            for port in lo..=hi {
                match TcpListener::bind((listen_ip, port)).await {
                    Ok(l) => {
                        bound = Some(l);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match bound {
                Some(l) => l,
                None => {
                    let e = last_err
                        .map(anyhow::Error::from)
                        .unwrap_or_else(|| anyhow::anyhow!("empty server port range"));
                    return Err(e.context(format!("no free port in {lo}..={hi}")));
                }
            }
        }
    };
    let addr = listener.local_addr()?;
    info!(%addr, "server listening");
    Ok((listener, addr))
}

impl Server {
    pub fn new(
        local_addr: SocketAddr,
        local_filter: Filter,
        exit_when_done: bool,
        clearing_house: Arc<ClearingHouse>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_addr,
            local_filter,
            exit_when_done,
            socket_timeout: config.socket_timeout,
            clearing_house,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted.context("error accepting connection")?,
            };
            trace!(%addr, "accepted socket");
            let server = self.clone();
            let cancel = cancel.clone();
            spawn(error_span!("handshake", %addr), async move {
                server.handle_socket(stream, addr, cancel).await;
                Ok(())
            });
        }
    }

    async fn handle_socket(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        if let Err(e) = apply_socket_options(&stream) {
            debug!("error setting socket options: {e}");
        }
        let hello = match read_hello(&mut stream, self.socket_timeout).await {
            Ok(hello) => hello,
            Err(e) => {
                debug!(%addr, "rejecting socket: {e:#}");
                return;
            }
        };
        if let Some(connection) = self.register_stream(&hello, stream) {
            let remote = hello.server_addr;
            debug!(%remote, id = hello.connection_id, "connection complete, starting peer");
            let peer = Peer::new(
                connection,
                self.local_filter.clone(),
                self.clearing_house.clone(),
                self.socket_timeout,
                self.exit_when_done,
                cancel.child_token(),
            );
            spawn(error_span!("peer", %remote), async move {
                peer.run().await?;
                Ok(())
            });
        }
    }

    /// Files the socket under its connection identifier; returns the ready
    /// connection once the third stream arrives.
    fn register_stream(&self, hello: &StreamHello, stream: TcpStream) -> Option<Connection> {
        let mut pending = self.pending.lock();
        pending.retain(|_, p| p.created.elapsed() < PENDING_EXPIRY);

        let key = (hello.server_addr, hello.connection_id);
        let entry = pending.entry(key).or_insert_with(PendingConnection::new);
        entry.insert(hello.kind, stream);
        if !entry.is_ready() {
            return None;
        }
        let ready = pending.remove(&key)?;
        let streams = ready.into_streams()?;
        Some(Connection::new(
            ConnectionKey {
                local_server: self.local_addr,
                remote_server: hello.server_addr,
            },
            hello.connection_id,
            streams,
        ))
    }
}

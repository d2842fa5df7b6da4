// Subscriber-side view of the tracker. Fresh topology over TCP when the
// tracker answers; otherwise the copy distributed through the archive.
// Only when neither exists does subscribing fail.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bincode::Options;
use parking_lot::Mutex;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use libspate_core::{ArchivePath, Config, Filter, Topology, archive_path::ADMIN_DIR_NAME};
use libspate_wire_protocol::{
    ReadBuf, send_msg,
    tracker::{TrackerRequest, TrackerResponse, encode_offline_report},
};

use crate::archive::Archive;
use crate::error::{Error, Result};

/// Where a tracker's serialized topology lives inside every archive.
pub fn admin_topology_path(tracker: SocketAddr) -> ArchivePath {
    ArchivePath::new(format!("{ADMIN_DIR_NAME}/{tracker}/Topology"))
        .expect("socket addresses form valid archive path components")
}

pub(crate) fn encode_topology(topology: &Topology) -> anyhow::Result<Vec<u8>> {
    bincode::DefaultOptions::new()
        .serialize(topology)
        .context("error serializing topology")
}

pub(crate) fn decode_topology(bytes: &[u8]) -> anyhow::Result<Topology> {
    bincode::DefaultOptions::new()
        .deserialize(bytes)
        .context("error deserializing topology")
}

#[derive(Default)]
struct ProxyState {
    cached: Option<Topology>,
    report_addr: Option<SocketAddr>,
}

pub struct TrackerProxy {
    tracker_addr: SocketAddr,
    local_server: SocketAddr,
    /// The filter this node registers under: what it can serve.
    serve_filter: Filter,
    archive: Arc<Archive>,
    state: Mutex<ProxyState>,
    socket_timeout: Duration,
}

impl TrackerProxy {
    pub fn new(
        tracker_addr: SocketAddr,
        local_server: SocketAddr,
        serve_filter: Filter,
        archive: Arc<Archive>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker_addr,
            local_server,
            serve_filter,
            archive,
            state: Mutex::new(ProxyState::default()),
            socket_timeout: config.socket_timeout,
        })
    }

    /// The filter-specific sub-topology, preferring fresh tracker data and
    /// silently falling back to the archived copy.
    pub async fn topology(&self, filter: &Filter) -> Result<Topology> {
        match self.fetch_fresh().await {
            Ok(topology) => Ok(topology.subset(filter)),
            Err(e) => {
                warn!(tracker = %self.tracker_addr, "tracker unreachable ({e:#}), using archived topology");
                if let Some(topology) = self.archived() {
                    self.state.lock().cached = Some(topology.clone());
                    return Ok(topology.subset(filter));
                }
                if let Some(cached) = self.state.lock().cached.clone() {
                    return Ok(cached.subset(filter));
                }
                Err(Error::TopologyUnavailable)
            }
        }
    }

    async fn fetch_fresh(&self) -> anyhow::Result<Topology> {
        let mut stream =
            tokio::time::timeout(self.socket_timeout, TcpStream::connect(self.tracker_addr))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))
                .and_then(|r| r)
                .context("error connecting to tracker")?;
        send_msg(
            &mut stream,
            &TrackerRequest::Topology {
                server: self.local_server,
                filter: self.serve_filter.clone(),
            },
        )
        .await
        .context("error sending tracker request")?;
        let mut read_buf = ReadBuf::new();
        let response: TrackerResponse = read_buf
            .recv_msg_timeout(&mut stream, self.socket_timeout)
            .await
            .context("error reading tracker response")?;
        match response {
            TrackerResponse::Topology {
                topology,
                report_addr,
            } => {
                let mut state = self.state.lock();
                state.cached = Some(topology.clone());
                state.report_addr = Some(report_addr);
                Ok(topology)
            }
            other => anyhow::bail!("unexpected tracker response {other:?}"),
        }
    }

    fn archived(&self) -> Option<Topology> {
        let path = admin_topology_path(self.tracker_addr);
        let bytes = self.archive.restore(&path).ok()?;
        match decode_topology(&bytes) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(%path, "archived topology unreadable: {e:#}");
                None
            }
        }
    }

    /// One datagram telling the tracker a server looks dead. Best effort;
    /// nothing is expected back.
    pub async fn report_offline(&self, server: SocketAddr) {
        let Some(report_addr) = self.state.lock().report_addr else {
            debug!(%server, "no report address known yet, skipping offline report");
            return;
        };
        let result: anyhow::Result<()> = async {
            let bind_addr: SocketAddr = if report_addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            let datagram = encode_offline_report(server)?;
            socket.send_to(&datagram, report_addr).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => debug!(%server, %report_addr, "offline report sent"),
            Err(e) => debug!(%server, "error sending offline report: {e:#}"),
        }
    }
}

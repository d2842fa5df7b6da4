// The bootstrapping directory service. Not part of the data plane: it
// registers servers under the filters they can satisfy, hands joining
// subscribers the current topology, and prunes servers that a probe
// confirms dead after an offline report.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, warn};

use libspate_core::{Config, Filter, Predicate, Topology, spawn_utils::spawn};
use libspate_wire_protocol::{
    ReadBuf, send_msg,
    tracker::{TrackerRequest, TrackerResponse, decode_offline_report},
};

pub struct Tracker {
    local_addr: SocketAddr,
    report_addr: SocketAddr,
    topology: Mutex<Topology>,
    topology_tx: watch::Sender<Topology>,
    checker_slots: Arc<Semaphore>,
    socket_timeout: Duration,
}

impl Tracker {
    /// Binds the tracker's TCP request port and its UDP offline-report
    /// port (on the same IP, OS-assigned).
    pub async fn bind(
        listen: SocketAddr,
        config: &Config,
    ) -> anyhow::Result<(Arc<Self>, TcpListener, UdpSocket)> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("error binding tracker to {listen}"))?;
        let local_addr = listener.local_addr()?;
        let udp = UdpSocket::bind((listen.ip(), 0))
            .await
            .context("error binding offline-report socket")?;
        let report_addr = udp.local_addr()?;
        info!(%local_addr, %report_addr, "tracker listening");
        let tracker = Arc::new(Self {
            local_addr,
            report_addr,
            topology: Mutex::new(Topology::default()),
            topology_tx: watch::Sender::new(Topology::default()),
            checker_slots: Arc::new(Semaphore::new(config.max_server_checker_tasks.max(1))),
            socket_timeout: config.socket_timeout,
        });
        Ok((tracker, listener, udp))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Every topology change is published here; the publisher's listener
    /// redistributes it through the archive.
    pub fn subscribe_topology(&self) -> watch::Receiver<Topology> {
        self.topology_tx.subscribe()
    }

    pub fn register(&self, filter: Filter, server: SocketAddr) {
        let mut topology = self.topology.lock();
        if topology.add(filter.clone(), server) {
            debug!(%server, %filter, "registered server");
            self.topology_tx.send_replace(topology.clone());
        }
    }

    pub fn remove_server(&self, server: SocketAddr) {
        let mut topology = self.topology.lock();
        if topology.remove_server(server) {
            info!(%server, "removed dead server from topology");
            self.topology_tx.send_replace(topology.clone());
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology.lock().clone()
    }

    /// Serves TCP requests and UDP offline reports until cancelled.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        udp: UdpSocket,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.context("error accepting tracker request")?;
                    let tracker = self.clone();
                    spawn(error_span!("tracker_request", %addr), async move {
                        tracker.handle_request(stream).await
                    });
                }
                received = udp.recv_from(&mut buf) => {
                    let (len, from) = received.context("error reading offline report")?;
                    match decode_offline_report(&buf[..len]) {
                        Ok(server) => self.clone().dispatch_probe(server, from),
                        Err(e) => debug!(%from, "undecodable offline report: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_request(self: Arc<Self>, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut read_buf = ReadBuf::new();
        let request: TrackerRequest = read_buf
            .recv_msg_timeout(&mut stream, self.socket_timeout)
            .await
            .context("error reading tracker request")?;
        let response = match request {
            TrackerRequest::Topology { server, filter } => {
                self.register(filter, server);
                TrackerResponse::Topology {
                    topology: self.topology(),
                    report_addr: self.report_addr,
                }
            }
            TrackerRequest::Network { filter: _ } => TrackerResponse::Topology {
                topology: self.topology(),
                report_addr: self.report_addr,
            },
            TrackerRequest::Subscription => TrackerResponse::Subscription {
                tracker_addr: self.local_addr,
                predicate: Predicate::everything(),
            },
        };
        send_msg(&mut stream, &response)
            .await
            .context("error sending tracker response")?;
        Ok(())
    }

    /// A subscriber says it could not reach `server`. Trust but verify:
    /// probe it ourselves and only then prune it.
    fn dispatch_probe(self: Arc<Self>, server: SocketAddr, reported_by: SocketAddr) {
        debug!(%server, %reported_by, "offline report received");
        spawn(error_span!("server_check", %server), async move {
            let Ok(_permit) = self.checker_slots.clone().acquire_owned().await else {
                return Ok(());
            };
            match tokio::time::timeout(self.socket_timeout, TcpStream::connect(server)).await {
                Ok(Ok(_stream)) => {
                    debug!(%server, "reported server is alive, keeping it");
                }
                Ok(Err(e)) => {
                    warn!(%server, "probe failed ({e}), pruning");
                    self.remove_server(server);
                }
                Err(_) => {
                    warn!(%server, "probe timed out, pruning");
                    self.remove_server(server);
                }
            }
            Ok(())
        });
    }
}

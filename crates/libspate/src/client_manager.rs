// Keeps one filter's upstream peer set at its target size: poor performers
// are replaced, dead servers are reported to the tracker, and invalid ones
// sit out a decay period before they are tried again.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, trace, warn};

use libspate_core::{Config, Filter, spawn_utils::spawn};

use crate::clearing_house::ClearingHouse;
use crate::client::{ClientOutcome, run_client};
use crate::peer::PeerCounters;
use crate::tracker_proxy::TrackerProxy;

struct ActiveClient {
    cancel: CancellationToken,
    counters: Arc<PeerCounters>,
}

enum TermReport {
    Done,
    Cancelled,
    Invalid,
    /// Connection refused or reset: the server looks dead, tell the
    /// tracker.
    Refused,
    /// Some other I/O failure; worth retrying after the decay period.
    Failed,
}

fn classify_error(e: &anyhow::Error) -> TermReport {
    let refused = e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                )
            })
    });
    if refused {
        TermReport::Refused
    } else {
        TermReport::Failed
    }
}

pub struct ClientManager {
    filter: Filter,
    local_server: SocketAddr,
    clearing_house: Arc<ClearingHouse>,
    proxy: Arc<TrackerProxy>,
    config: Config,
}

impl ClientManager {
    pub fn new(
        filter: Filter,
        local_server: SocketAddr,
        clearing_house: Arc<ClearingHouse>,
        proxy: Arc<TrackerProxy>,
        config: Config,
    ) -> Self {
        Self {
            filter,
            local_server,
            clearing_house,
            proxy,
            config,
        }
    }

    /// The control loop: trim, grow, reset counters, wait. Exits when
    /// cancelled or when the local predicate drains empty.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let target = self.config.min_clients_per_filter.max(1);
        let mut clients: HashMap<SocketAddr, ActiveClient> = HashMap::new();
        let mut invalid: HashMap<SocketAddr, Instant> = HashMap::new();
        let (term_tx, mut term_rx) = mpsc::unbounded_channel::<(SocketAddr, TermReport)>();
        let mut done_rx = self.clearing_house.subscribe_done();

        loop {
            invalid.retain(|_, since| since.elapsed() < self.config.invalid_server_decay);

            // Replace the worst performers when over target.
            if clients.len() > target {
                let mut ranked: Vec<(u64, SocketAddr)> = clients
                    .iter()
                    .map(|(addr, c)| (c.counters.useful_bytes(), *addr))
                    .collect();
                ranked.sort();
                for (bytes, addr) in ranked.iter().take(clients.len() - target) {
                    info!(%addr, bytes, "cancelling worst-ranked client");
                    if let Some(c) = clients.get(addr) {
                        c.cancel.cancel();
                    }
                }
            }

            // Grow back up to target from the tracker's view of the world.
            while clients.len() < target {
                let topology = match self.proxy.topology(&self.filter).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("no topology available: {e:#}");
                        break;
                    }
                };
                let mut exclude: BTreeSet<SocketAddr> =
                    self.clearing_house.peer_remote_servers();
                exclude.insert(self.local_server);
                exclude.extend(clients.keys().copied());
                exclude.extend(invalid.keys().copied());
                let Some(remote) = topology.best_server(&self.filter, &exclude) else {
                    trace!("no further candidate servers");
                    break;
                };
                debug!(%remote, "starting client");
                let counters = Arc::new(PeerCounters::default());
                let client_cancel = cancel.child_token();
                clients.insert(
                    remote,
                    ActiveClient {
                        cancel: client_cancel.clone(),
                        counters: counters.clone(),
                    },
                );
                let term_tx = term_tx.clone();
                let ch = self.clearing_house.clone();
                let filter = self.filter.clone();
                let config = self.config.clone();
                let local_server = self.local_server;
                spawn(error_span!("client", %remote), async move {
                    let result = run_client(
                        local_server,
                        remote,
                        filter,
                        ch,
                        &config,
                        counters,
                        client_cancel,
                    )
                    .await;
                    let report = match &result {
                        Ok(ClientOutcome::Done) => TermReport::Done,
                        Ok(ClientOutcome::Cancelled) => TermReport::Cancelled,
                        Ok(ClientOutcome::InvalidServer) => TermReport::Invalid,
                        Err(e) => classify_error(e),
                    };
                    let _ = term_tx.send((remote, report));
                    result.map(|_| ())
                });
            }

            for client in clients.values() {
                client.counters.reset();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.client_replacement_period) => {}
                changed = done_rx.changed() => {
                    if changed.is_err() || *done_rx.borrow_and_update() {
                        debug!("predicate satisfied, shutting down clients");
                        break;
                    }
                }
                report = term_rx.recv() => {
                    if let Some((addr, report)) = report {
                        self.handle_termination(addr, report, &mut clients, &mut invalid).await;
                    }
                }
            }
            // Drain any further terminations that queued up meanwhile.
            while let Ok((addr, report)) = term_rx.try_recv() {
                self.handle_termination(addr, report, &mut clients, &mut invalid)
                    .await;
            }
        }

        for client in clients.values() {
            client.cancel.cancel();
        }
        Ok(())
    }

    async fn handle_termination(
        &self,
        addr: SocketAddr,
        report: TermReport,
        clients: &mut HashMap<SocketAddr, ActiveClient>,
        invalid: &mut HashMap<SocketAddr, Instant>,
    ) {
        clients.remove(&addr);
        match report {
            TermReport::Done => debug!(%addr, "client exhausted its server"),
            TermReport::Cancelled => {}
            TermReport::Invalid => {
                info!(%addr, "marking invalid server");
                invalid.insert(addr, Instant::now());
            }
            TermReport::Refused => {
                info!(%addr, "server unreachable, reporting offline");
                self.proxy.report_offline(addr).await;
                invalid.insert(addr, Instant::now());
            }
            TermReport::Failed => {
                debug!(%addr, "client failed, sidelining server for a while");
                invalid.insert(addr, Instant::now());
            }
        }
    }
}

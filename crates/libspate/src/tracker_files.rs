// Redistributes the tracker's topology through the data plane: each new
// snapshot is saved into the publisher's archive under the administrative
// subtree, from where it flows to subscribers like any other file. This is
// the resilience path for tracker outages.
//
// Holds only the archive's save surface, registered as a collaborator of
// the tracker rather than an owner of either side.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, warn};

use libspate_core::{
    Topology,
    spawn_utils::{BlockingSpawner, spawn_with_cancel},
};

use crate::archive::Archive;
use crate::tracker_proxy::{admin_topology_path, encode_topology};

pub struct DistributedTrackerFiles {}

impl DistributedTrackerFiles {
    /// Saves the current topology now and then again on every change,
    /// until cancelled. The topology file never expires on its own.
    pub fn start(
        archive: Arc<Archive>,
        tracker_addr: SocketAddr,
        mut topology_rx: watch::Receiver<Topology>,
        cancel: CancellationToken,
    ) {
        let path = admin_topology_path(tracker_addr);
        spawn_with_cancel(
            error_span!("tracker_files", %path),
            cancel,
            async move {
                let spawner = BlockingSpawner::default();
                loop {
                    let topology = topology_rx.borrow_and_update().clone();
                    match encode_topology(&topology) {
                        Ok(bytes) => {
                            let saved = spawner
                                .spawn_block_in_place(|| archive.save(&path, &bytes, -1));
                            match saved {
                                Ok(info) => debug!(id = %info.id, "distributed topology"),
                                Err(e) => warn!("error saving topology: {e:#}"),
                            }
                        }
                        Err(e) => warn!("error encoding topology: {e:#}"),
                    }
                    if topology_rx.changed().await.is_err() {
                        return Ok(());
                    }
                }
            },
        );
    }
}

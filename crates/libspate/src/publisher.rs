// Composition root of a publishing node: archive + watcher + source
// server + colocated tracker, wired together under one cancellation
// token.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error_span, warn};

use libspate_core::{
    Config, Filter, Predicate,
    spawn_utils::{BlockingSpawner, spawn, spawn_with_cancel},
};

use crate::archive::{
    Archive, DelayedActionQueue,
    watcher::{FileWatcher, WatchEvent},
};
use crate::clearing_house::ClearingHouse;
use crate::server::{Server, bind_listener};
use crate::tracker::Tracker;
use crate::tracker_files::DistributedTrackerFiles;

pub struct PublisherOptions {
    pub root: PathBuf,
    pub listen_ip: IpAddr,
    /// Where the colocated tracker listens.
    pub tracker_listen: SocketAddr,
    pub config: Config,
}

pub struct Publisher {
    server_addr: SocketAddr,
    tracker_addr: SocketAddr,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
}

pub(crate) fn start_deletion_queue(
    archive: &Arc<Archive>,
    cancel: &CancellationToken,
) -> crate::error::Result<Arc<DelayedActionQueue>> {
    let queue = DelayedActionQueue::load(archive.deletion_queue_path(), {
        let archive = archive.clone();
        Box::new(move |id| {
            if let Err(e) = archive.remove(id) {
                warn!(%id, "deferred deletion failed: {e:#}");
            }
        })
    })?;
    archive.set_delay_queue(queue.clone());
    spawn(
        error_span!("deletion_queue"),
        queue.clone().run(cancel.clone()),
    );
    Ok(queue)
}

impl Publisher {
    pub async fn start(
        options: PublisherOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<Publisher> {
        let config = options.config.clone();
        let archive = Archive::new(&options.root, &config)?;
        start_deletion_queue(&archive, &cancel)?;

        // A source node wants nothing; its peers only ever pull from it.
        let clearing_house = ClearingHouse::new(archive.clone(), Predicate::nothing());

        let (listener, server_addr) = bind_listener(options.listen_ip, &config).await?;
        let server = Server::new(
            server_addr,
            Filter::Nothing,
            false,
            clearing_house.clone(),
            &config,
        );
        spawn(
            error_span!("server", addr = %server_addr),
            server.run(listener, cancel.clone()),
        );

        let (tracker, tracker_listener, tracker_udp) =
            Tracker::bind(options.tracker_listen, &config).await?;
        let tracker_addr = tracker.local_addr();
        DistributedTrackerFiles::start(
            archive.clone(),
            tracker_addr,
            tracker.subscribe_topology(),
            cancel.clone(),
        );
        tracker.register(Filter::Everything, server_addr);
        spawn(
            error_span!("tracker", addr = %tracker_addr),
            tracker.clone().run(tracker_listener, tracker_udp, cancel.clone()),
        );

        let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
        FileWatcher::start(archive.clone(), watch_tx, cancel.clone())?;
        {
            let clearing_house = clearing_house.clone();
            spawn_with_cancel(error_span!("announcer"), cancel.clone(), async move {
                let spawner = BlockingSpawner::default();
                while let Some(event) = watch_rx.recv().await {
                    match event {
                        WatchEvent::Appeared(info) => {
                            clearing_house.announce_file(&info).await;
                        }
                        WatchEvent::Removed(id) => {
                            // Drop any lingering archive state for the
                            // version, then tell the peers.
                            let _ = spawner
                                .spawn_block_in_place(|| clearing_house.archive().remove(&id));
                            clearing_house.announce_removal(&id).await;
                        }
                    }
                }
                Ok(())
            });
        }

        Ok(Publisher {
            server_addr,
            tracker_addr,
            archive,
            clearing_house,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker_addr
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn clearing_house(&self) -> &Arc<ClearingHouse> {
        &self.clearing_house
    }
}

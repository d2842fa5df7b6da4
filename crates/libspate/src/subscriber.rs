// Composition root of a subscribing node: archive + sink server + tracker
// proxy + one client manager per subscribed filter.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error_span;

use libspate_core::{Config, Predicate, spawn_utils::spawn};

use crate::archive::Archive;
use crate::clearing_house::ClearingHouse;
use crate::client_manager::ClientManager;
use crate::publisher::start_deletion_queue;
use crate::server::{Server, bind_listener};
use crate::tracker_proxy::TrackerProxy;

pub struct SubscriberOptions {
    pub root: PathBuf,
    pub listen_ip: IpAddr,
    pub tracker_addr: SocketAddr,
    pub predicate: Predicate,
    pub config: Config,
}

pub struct Subscriber {
    server_addr: SocketAddr,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
}

impl Subscriber {
    pub async fn start(
        options: SubscriberOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<Subscriber> {
        let config = options.config.clone();
        let archive = Archive::new(&options.root, &config)?;
        start_deletion_queue(&archive, &cancel)?;

        let clearing_house = ClearingHouse::new(archive.clone(), options.predicate.clone());

        let (listener, server_addr) = bind_listener(options.listen_ip, &config).await?;
        let serve_filter = options.predicate.covering_filter();
        let server = Server::new(
            server_addr,
            serve_filter.clone(),
            true,
            clearing_house.clone(),
            &config,
        );
        spawn(
            error_span!("server", addr = %server_addr),
            server.run(listener, cancel.clone()),
        );

        let proxy = TrackerProxy::new(
            options.tracker_addr,
            server_addr,
            serve_filter,
            archive.clone(),
            &config,
        );
        for filter in options.predicate.filters() {
            let manager = ClientManager::new(
                filter.clone(),
                server_addr,
                clearing_house.clone(),
                proxy.clone(),
                config.clone(),
            );
            spawn(
                error_span!("client_manager", %filter),
                manager.run(cancel.clone()),
            );
        }

        Ok(Subscriber {
            server_addr,
            archive,
            clearing_house,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn clearing_house(&self) -> &Arc<ClearingHouse> {
        &self.clearing_house
    }

    pub fn files_received(&self) -> u64 {
        self.clearing_house.files_received()
    }

    /// Resolves once the predicate matches nothing (never, for indefinite
    /// subscriptions).
    pub async fn wait_done(&self) {
        let mut done = self.clearing_house.subscribe_done();
        let _ = done.wait_for(|d| *d).await;
    }
}

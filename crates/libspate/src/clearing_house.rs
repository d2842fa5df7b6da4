// The per-node router. Every incoming notice and piece passes through
// here: wanted pieces are requested exactly once, arrived pieces land in
// the archive and are re-announced to every other peer whose filter
// covers them.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use libspate_core::{FileId, FileInfo, Piece, PieceSpec, Predicate, spawn_utils::BlockingSpawner};

use crate::archive::{Archive, PutOutcome};
use crate::error::{Error, Result};
use crate::peer::{PeerHandle, PeerKey};

/// What became of a delivered piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Used {
        /// The local predicate now matches nothing.
        done: bool,
    },
    NotUsed {
        /// Terminal: the predicate matches nothing, so nothing further is
        /// wanted from anyone.
        terminal: bool,
    },
}

pub struct ClearingHouse {
    archive: Arc<Archive>,
    predicate: Mutex<Predicate>,
    peers: Mutex<BTreeMap<PeerKey, Arc<PeerHandle>>>,
    files_received: AtomicU64,
    bytes_received: AtomicU64,
    done_tx: watch::Sender<bool>,
    spawner: BlockingSpawner,
}

impl ClearingHouse {
    pub fn new(archive: Arc<Archive>, predicate: Predicate) -> Arc<Self> {
        let done = predicate.matches_nothing();
        Arc::new(Self {
            archive,
            predicate: Mutex::new(predicate),
            peers: Mutex::new(BTreeMap::new()),
            files_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            done_tx: watch::Sender::new(done),
            spawner: BlockingSpawner::default(),
        })
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn files_received(&self) -> u64 {
        self.files_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn predicate_matches_nothing(&self) -> bool {
        self.predicate.lock().matches_nothing()
    }

    /// Fires once the predicate drains empty.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Idempotent under the ordered-set semantics: a peer equal under
    /// (connection, local filter) is kept once.
    pub fn add_peer(&self, peer: Arc<PeerHandle>) -> bool {
        let mut peers = self.peers.lock();
        match peers.entry(peer.key().clone()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(peer);
                true
            }
        }
    }

    pub fn remove_peer(&self, key: &PeerKey) -> bool {
        self.peers.lock().remove(key).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Server addresses of every currently registered peer; the client
    /// manager excludes these from its outbound candidates.
    pub fn peer_remote_servers(&self) -> BTreeSet<SocketAddr> {
        self.peers
            .lock()
            .keys()
            .map(|k| k.connection.remote_server)
            .collect()
    }

    fn other_peers(&self, from: &PeerKey) -> Vec<Arc<PeerHandle>> {
        self.peers
            .lock()
            .iter()
            .filter(|(key, _)| *key != from)
            .map(|(_, peer)| peer.clone())
            .collect()
    }

    /// An incoming `HavePiece`: request the piece from the announcing peer
    /// if it is still wanted and not already archived.
    pub async fn process_notice(&self, from: &Arc<PeerHandle>, spec: PieceSpec) -> anyhow::Result<()> {
        if !self.predicate.lock().matches_spec(&spec) {
            return Ok(());
        }
        match self.spawner.spawn_block_in_place(|| self.archive.has_piece(&spec)) {
            Ok(true) => Ok(()),
            Ok(false) => {
                trace!(piece = %spec, "requesting");
                from.add_request(spec).await
            }
            Err(e @ Error::VersionMismatch { .. }) => {
                // Fatal for this file only; keep exchanging others.
                warn!(piece = %spec, "ignoring noticed piece: {e}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// An arrived piece: archive it if still wanted, then fan the
    /// availability out to every other interested peer. Fan-out goes
    /// through per-peer queues so one slow peer does not stall this one.
    pub async fn process_piece(
        &self,
        from: &Arc<PeerHandle>,
        piece: Piece,
    ) -> anyhow::Result<PieceStatus> {
        let spec = piece.spec().clone();
        {
            let predicate = self.predicate.lock();
            if !predicate.matches_spec(&spec) {
                return Ok(PieceStatus::NotUsed {
                    terminal: predicate.matches_nothing(),
                });
            }
        }

        let outcome = self
            .spawner
            .spawn_block_in_place(|| self.archive.put_piece(&piece));
        let completed = match outcome {
            Ok(PutOutcome::Written { completed }) => completed,
            Ok(PutOutcome::AlreadyPresent) => {
                return Ok(PieceStatus::NotUsed { terminal: false });
            }
            Err(e @ Error::StaleVersion { .. }) => {
                // An older version than the archive holds: dropped without
                // ceremony.
                debug!(piece = %spec, "{e}");
                return Ok(PieceStatus::NotUsed { terminal: false });
            }
            Err(e @ Error::VersionMismatch { .. }) => {
                warn!(piece = %spec, "dropping irreconcilable piece: {e}");
                return Ok(PieceStatus::NotUsed { terminal: false });
            }
            Err(e) => return Err(e.into()),
        };

        self.bytes_received
            .fetch_add(spec.len() as u64, Ordering::Relaxed);
        let mut done = false;
        let mut shrunk_to = None;
        if completed {
            let mut predicate = self.predicate.lock();
            let shrank = predicate.remove_if_possible(&spec.info);
            self.files_received.fetch_add(1, Ordering::Relaxed);
            done = predicate.matches_nothing();
            if shrank {
                shrunk_to = Some(predicate.covering_filter());
            }
            drop(predicate);
            if done {
                self.done_tx.send_replace(true);
            }
        }

        for peer in self.other_peers(from.key()) {
            peer.notify_remote_if_desired(&spec).await;
        }
        // The filter shrank; let every peer know so it stops announcing
        // what is no longer wanted.
        if let Some(filter) = shrunk_to {
            let peers: Vec<Arc<PeerHandle>> = self.peers.lock().values().cloned().collect();
            for peer in peers {
                peer.send_have_filter(filter.clone()).await;
            }
        }

        Ok(PieceStatus::Used { done })
    }

    /// A remote `FileRemoved`: apply it locally (only the matching version
    /// dies) and forward to the other interested peers.
    pub async fn process_removal(&self, from: &Arc<PeerHandle>, id: FileId) -> anyhow::Result<()> {
        let removed = self.spawner.spawn_block_in_place(|| self.archive.remove(&id))?;
        if removed {
            debug!(%id, "removed on notice");
            for peer in self.other_peers(from.key()) {
                peer.notify_file_removed(&id).await;
            }
        }
        Ok(())
    }

    /// A locally appeared file (publisher watcher): announce every piece
    /// to every interested peer.
    pub async fn announce_file(&self, info: &FileInfo) {
        let peers: Vec<Arc<PeerHandle>> = self.peers.lock().values().cloned().collect();
        for spec in info.iter_piece_specs() {
            for peer in &peers {
                peer.notify_remote_if_desired(&spec).await;
            }
        }
    }

    /// A locally removed file: tell everyone.
    pub async fn announce_removal(&self, id: &FileId) {
        let peers: Vec<Arc<PeerHandle>> = self.peers.lock().values().cloned().collect();
        for peer in peers {
            peer.notify_file_removed(id).await;
        }
    }

    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Piece> {
        self.archive.get_piece(spec)
    }

    pub fn remove(&self, id: &FileId) -> Result<bool> {
        self.archive.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionKey};
    use crate::peer::Peer;
    use libspate_core::{Config, Filter};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    async fn three_sockets() -> [TcpStream; 3] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut out = Vec::new();
        for _ in 0..3 {
            let (connected, _accepted) =
                tokio::join!(TcpStream::connect(addr), listener.accept());
            out.push(connected.unwrap());
        }
        out.try_into().unwrap()
    }

    fn test_peer(
        clearing_house: &Arc<ClearingHouse>,
        remote_port: u16,
        streams: [TcpStream; 3],
    ) -> Peer {
        let key = ConnectionKey {
            local_server: "127.0.0.1:1000".parse::<SocketAddr>().unwrap(),
            remote_server: format!("127.0.0.1:{remote_port}").parse().unwrap(),
        };
        Peer::new(
            Connection::new(key, 1, streams),
            Filter::Everything,
            clearing_house.clone(),
            Duration::from_secs(1),
            false,
            CancellationToken::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_set_add_remove_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().join("a"), &Config::default()).unwrap();
        let ch = ClearingHouse::new(archive, Predicate::everything());

        let peer_a = test_peer(&ch, 2000, three_sockets().await);
        let peer_b = test_peer(&ch, 3000, three_sockets().await);

        assert!(ch.add_peer(peer_a.handle()));
        assert!(!ch.add_peer(peer_a.handle()), "second add is a no-op");
        assert!(ch.add_peer(peer_b.handle()));
        assert_eq!(ch.peer_count(), 2);
        assert_eq!(
            ch.peer_remote_servers().len(),
            2,
            "both remote servers visible for client-manager exclusion"
        );

        assert!(ch.remove_peer(peer_a.handle().key()));
        assert!(!ch.remove_peer(peer_a.handle().key()));
        assert_eq!(ch.peer_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_done_watch_starts_satisfied_for_empty_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path().join("a"), &Config::default()).unwrap();
        let source = ClearingHouse::new(archive.clone(), Predicate::nothing());
        assert!(*source.subscribe_done().borrow());

        let sink = ClearingHouse::new(archive, Predicate::everything());
        assert!(!*sink.subscribe_done().borrow());
    }
}

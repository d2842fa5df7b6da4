// One peer drives one three-stream connection. After the filter handshake
// both sides announce what they hold, then notices, requests and piece
// data flow concurrently: the three readers, the two writers and the
// request server all race in one task and the first failure tears the
// whole peer down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use libspate_core::{FileId, Filter, PieceSpec, spawn_utils::BlockingSpawner};
use libspate_wire_protocol::{
    DataMessage, NoticeMessage, ReadBuf, RequestMessage, WireError, send_msg,
};

use crate::clearing_house::{ClearingHouse, PieceStatus};
use crate::connection::{Connection, ConnectionKey};

/// Cap on unsatisfied outbound requests per peer; the notice reader blocks
/// once it is reached.
pub const MAX_OUTSTANDING_REQUESTS: usize = 128;

/// Cap on queued outbound notices per peer.
const NOTICE_QUEUE_CAP: usize = 1024;

/// A peer is uniquely determined by its connection and its local filter.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PeerKey {
    pub connection: ConnectionKey,
    pub filter: Filter,
}

#[derive(Default, Debug)]
pub struct PeerCounters {
    useful_bytes: AtomicU64,
    served_pieces: AtomicU64,
}

impl PeerCounters {
    pub fn add_useful_bytes(&self, n: u64) {
        self.useful_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Useful bytes received since the last reset; the client manager's
    /// ranking key.
    pub fn useful_bytes(&self) -> u64 {
        self.useful_bytes.load(Ordering::Relaxed)
    }

    pub fn inc_served(&self) {
        self.served_pieces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn served_pieces(&self) -> u64 {
        self.served_pieces.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.useful_bytes.store(0, Ordering::Relaxed);
    }
}

/// The shareable half of a peer: what the clearing house keeps in its
/// ordered peer set and what other peers use to queue notices across
/// connections without blocking on each other's sockets.
pub struct PeerHandle {
    key: PeerKey,
    remote_filter: RwLock<Filter>,
    notice_tx: mpsc::Sender<NoticeMessage>,
    request_tx: mpsc::Sender<PieceSpec>,
    counters: Arc<PeerCounters>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn counters(&self) -> &Arc<PeerCounters> {
        &self.counters
    }

    pub fn remote_filter(&self) -> Filter {
        self.remote_filter.read().clone()
    }

    pub(crate) fn set_remote_filter(&self, filter: Filter) {
        *self.remote_filter.write() = filter;
    }

    /// Queues an outbound piece request. Blocks while the outstanding set
    /// is full; errors only when the peer is gone.
    pub async fn add_request(&self, spec: PieceSpec) -> anyhow::Result<()> {
        self.request_tx
            .send(spec)
            .await
            .map_err(|_| anyhow::anyhow!("peer is gone"))
    }

    /// Announces a piece if the remote side's filter still wants it.
    pub async fn notify_remote_if_desired(&self, spec: &PieceSpec) -> bool {
        if !self.remote_filter.read().matches(&spec.info.id.path) {
            return false;
        }
        self.notice_tx
            .send(NoticeMessage::HavePiece(spec.clone()))
            .await
            .is_ok()
    }

    /// Re-advertises this side's (shrunken) filter to the remote end.
    pub async fn send_have_filter(&self, filter: Filter) -> bool {
        self.notice_tx
            .send(NoticeMessage::HaveFilter(filter))
            .await
            .is_ok()
    }

    pub async fn notify_file_removed(&self, id: &FileId) -> bool {
        if !self.remote_filter.read().matches(&id.path) {
            return false;
        }
        self.notice_tx
            .send(NoticeMessage::FileRemoved(id.clone()))
            .await
            .is_ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").field("key", &self.key).finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerOutcome {
    /// The local predicate matches nothing anymore.
    Done,
    Cancelled,
}

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("remote did not complete the filter handshake: {0}")]
    Handshake(#[source] WireError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PeerError {
    /// Whether the remote end spoke the wrong protocol (or hung up before
    /// the handshake) and should be marked an invalid server, as opposed
    /// to a transient failure.
    pub fn is_invalid_server(&self) -> bool {
        match self {
            PeerError::Handshake(w) => matches!(w, WireError::Eof | WireError::Decode(_)),
            PeerError::Protocol(_) => true,
            _ => false,
        }
    }
}

pub struct Peer {
    connection: Connection,
    local_filter: Filter,
    clearing_house: Arc<ClearingHouse>,
    handle: Arc<PeerHandle>,
    notice_rx: mpsc::Receiver<NoticeMessage>,
    request_rx: mpsc::Receiver<PieceSpec>,
    socket_timeout: Duration,
    exit_when_done: bool,
    cancel: CancellationToken,
}

impl Peer {
    pub fn new(
        connection: Connection,
        local_filter: Filter,
        clearing_house: Arc<ClearingHouse>,
        socket_timeout: Duration,
        exit_when_done: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_counters(
            connection,
            local_filter,
            clearing_house,
            socket_timeout,
            exit_when_done,
            cancel,
            Arc::new(PeerCounters::default()),
        )
    }

    pub fn with_counters(
        connection: Connection,
        local_filter: Filter,
        clearing_house: Arc<ClearingHouse>,
        socket_timeout: Duration,
        exit_when_done: bool,
        cancel: CancellationToken,
        counters: Arc<PeerCounters>,
    ) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_CAP);
        let (request_tx, request_rx) = mpsc::channel(MAX_OUTSTANDING_REQUESTS);
        let handle = Arc::new(PeerHandle {
            key: PeerKey {
                connection: connection.key,
                filter: local_filter.clone(),
            },
            remote_filter: RwLock::new(Filter::Nothing),
            notice_tx,
            request_tx,
            counters,
            cancel: cancel.clone(),
        });
        Self {
            connection,
            local_filter,
            clearing_house,
            handle,
            notice_rx,
            request_rx,
            socket_timeout,
            exit_when_done,
            cancel,
        }
    }

    pub fn handle(&self) -> Arc<PeerHandle> {
        self.handle.clone()
    }

    /// Drives the peer to completion: handshake, archive announcement,
    /// then steady state until error, cancellation, or (when requested)
    /// the local predicate draining empty.
    pub async fn run(self) -> Result<PeerOutcome, PeerError> {
        let Peer {
            connection,
            local_filter,
            clearing_house,
            handle,
            mut notice_rx,
            mut request_rx,
            socket_timeout,
            exit_when_done,
            cancel,
        } = self;

        let key = handle.key().clone();
        let [notice, request, data] = connection.into_streams();
        let (mut notice_r, mut notice_w) = notice.into_split();
        let (mut request_r, mut request_w) = request.into_split();
        let (mut data_r, mut data_w) = data.into_split();
        // One receive buffer per stream, living as long as the stream:
        // partially read frames survive read timeouts in it.
        let mut notice_buf = ReadBuf::new();
        let mut request_buf = ReadBuf::new();
        let mut data_buf = ReadBuf::new();

        // Handshake: exchange filters on the notice stream.
        send_msg(&mut notice_w, &NoticeMessage::HaveFilter(local_filter.clone()))
            .await
            .map_err(PeerError::Handshake)?;
        let remote_filter = match notice_buf
            .recv_msg_timeout::<NoticeMessage>(&mut notice_r, socket_timeout)
            .await
            .map_err(PeerError::Handshake)?
        {
            NoticeMessage::HaveFilter(f) => f,
            other => {
                return Err(PeerError::Protocol(format!(
                    "expected filter handshake, got {other:?}"
                )));
            }
        };
        trace!(%remote_filter, "handshake complete");
        handle.set_remote_filter(remote_filter.clone());

        clearing_house.add_peer(handle.clone());

        let spawner = BlockingSpawner::default();
        let (serve_tx, mut serve_rx) = mpsc::channel::<PieceSpec>(MAX_OUTSTANDING_REQUESTS);
        let mut done_rx = clearing_house.subscribe_done();

        let notice_reader = async {
            loop {
                match notice_buf
                    .recv_msg_timeout::<NoticeMessage>(&mut notice_r, socket_timeout)
                    .await
                {
                    Ok(NoticeMessage::HaveFilter(filter)) => {
                        trace!(%filter, "remote filter updated");
                        handle.set_remote_filter(filter);
                    }
                    Ok(NoticeMessage::HavePiece(spec)) => {
                        clearing_house.process_notice(&handle, spec).await?;
                    }
                    Ok(NoticeMessage::FileRemoved(id)) => {
                        clearing_house.process_removal(&handle, id).await?;
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(PeerError::Wire(e)),
                }
            }
        };

        let request_reader = async {
            loop {
                match request_buf
                    .recv_msg_timeout::<RequestMessage>(&mut request_r, socket_timeout)
                    .await
                {
                    Ok(RequestMessage::RequestPiece(spec)) => {
                        // Bounded; the remote will re-announce anything we
                        // shed here.
                        if serve_tx.try_send(spec).is_err() {
                            warn!("inbound request queue full, dropping request");
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(PeerError::Wire(e)),
                }
            }
        };

        let data_reader = async {
            loop {
                match data_buf
                    .recv_msg_timeout::<DataMessage>(&mut data_r, socket_timeout)
                    .await
                {
                    Ok(DataMessage::PieceData(piece)) => {
                        let received = piece.len() as u64;
                        match clearing_house.process_piece(&handle, piece).await? {
                            PieceStatus::Used { done } => {
                                handle.counters.add_useful_bytes(received);
                                if done && exit_when_done {
                                    return Ok(PeerOutcome::Done);
                                }
                            }
                            PieceStatus::NotUsed { terminal } => {
                                if terminal && exit_when_done {
                                    return Ok(PeerOutcome::Done);
                                }
                            }
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(PeerError::Wire(e)),
                }
            }
        };

        let notice_writer = async {
            loop {
                match notice_rx.recv().await {
                    Some(msg) => send_msg(&mut notice_w, &msg).await?,
                    None => return Err(PeerError::Protocol("notice queue closed".into())),
                }
            }
        };

        let request_writer = async {
            loop {
                match request_rx.recv().await {
                    Some(spec) => {
                        send_msg(&mut request_w, &RequestMessage::RequestPiece(spec)).await?
                    }
                    None => return Err(PeerError::Protocol("request queue closed".into())),
                }
            }
        };

        let data_server = async {
            loop {
                let Some(spec) = serve_rx.recv().await else {
                    return Err(PeerError::Protocol("serve queue closed".into()));
                };
                match spawner.spawn_block_in_place(|| clearing_house.get_piece(&spec)) {
                    Ok(piece) => {
                        send_msg(&mut data_w, &DataMessage::PieceData(piece)).await?;
                        handle.counters.inc_served();
                    }
                    // The file may have been superseded or deleted since
                    // the request was made.
                    Err(e) => debug!(piece = %spec, "cannot serve requested piece: {e:#}"),
                }
            }
        };

        // Announce every piece we already hold that the remote wants.
        let announce = async {
            match spawner.spawn_block_in_place(|| clearing_house.archive().walk(&remote_filter)) {
                Ok(files) => {
                    for info in files {
                        for spec in info.iter_piece_specs() {
                            if handle
                                .notice_tx
                                .send(NoticeMessage::HavePiece(spec))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("error walking archive for announcement: {e:#}"),
            }
            std::future::pending::<Result<PeerOutcome, PeerError>>().await
        };

        let done_watch = async {
            if !exit_when_done {
                std::future::pending::<()>().await;
            }
            loop {
                if *done_rx.borrow_and_update() {
                    return Ok(PeerOutcome::Done);
                }
                if done_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(PeerOutcome::Cancelled),
            r = done_watch => r,
            r = notice_reader => r,
            r = request_reader => r,
            r = data_reader => r,
            r = notice_writer => r,
            r = request_writer => r,
            r = data_server => r,
            r = announce => r,
        };

        clearing_house.remove_peer(&key);
        match &result {
            Ok(outcome) => debug!(connection = %key.connection, ?outcome, "peer finished"),
            Err(e) => debug!(connection = %key.connection, "peer finished with error: {e:#}"),
        }
        result
    }
}

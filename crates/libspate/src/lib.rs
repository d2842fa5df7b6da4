//! Peer-to-peer distribution of a growing, hierarchically named set of
//! files: a publisher's archive fans out to subscribers that also serve
//! each other, bootstrapped by a lightweight tracker.
//!
//! The main entry points are [`Publisher`] and [`Subscriber`]; the pieces
//! they are built from (the [`archive`], the peer machinery, the tracker)
//! are public for finer-grained embedding.

pub mod archive;
pub mod clearing_house;
pub mod client;
pub mod client_manager;
pub mod connection;
pub mod error;
pub mod peer;
pub mod publisher;
pub mod server;
pub mod subscriber;
pub mod tracker;
pub mod tracker_files;
pub mod tracker_proxy;

pub use archive::{Archive, DelayedActionQueue};
pub use clearing_house::{ClearingHouse, PieceStatus};
pub use error::Error;
pub use peer::{MAX_OUTSTANDING_REQUESTS, Peer, PeerCounters, PeerHandle, PeerKey};
pub use publisher::{Publisher, PublisherOptions};
pub use subscriber::{Subscriber, SubscriberOptions};
pub use tracker::Tracker;
pub use tracker_proxy::TrackerProxy;

#[cfg(test)]
mod tests;

/// The cargo version of libspate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

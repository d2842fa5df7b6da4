// Tracker control-plane records. Requests arrive framed on the tracker's
// TCP port; the offline report is a single UDP datagram.

use std::net::SocketAddr;

use bincode::Options;
use serde::{Deserialize, Serialize};

use libspate_core::{Filter, Predicate, Topology};

use crate::WireError;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum TrackerRequest {
    /// Returns the current topology and, as a side effect, registers the
    /// caller's server under the given filter.
    Topology { server: SocketAddr, filter: Filter },
    /// The variant used during an initial join; same payload, but the
    /// caller has nothing to serve yet so no registration happens.
    Network { filter: Filter },
    /// Returns a subscription template for this tracker.
    Subscription,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum TrackerResponse {
    Topology {
        topology: Topology,
        /// Where "server offline" datagrams go.
        report_addr: SocketAddr,
    },
    Subscription {
        tracker_addr: SocketAddr,
        predicate: Predicate,
    },
}

/// The offline-report datagram payload: the serialized address of the
/// server a subscriber failed to reach. No response is sent.
pub fn encode_offline_report(server: SocketAddr) -> Result<Vec<u8>, WireError> {
    bincode::DefaultOptions::new()
        .serialize(&server)
        .map_err(WireError::Encode)
}

pub fn decode_offline_report(datagram: &[u8]) -> Result<SocketAddr, WireError> {
    bincode::DefaultOptions::new()
        .deserialize(datagram)
        .map_err(WireError::Decode)
}

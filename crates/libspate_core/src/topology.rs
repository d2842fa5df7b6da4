use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::Filter;

/// The current mapping from filter to the set of servers known to satisfy
/// it. Shipped both over the tracker socket and, serialized, through the
/// archive itself, so it must round-trip.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    entries: BTreeMap<Filter, BTreeSet<SocketAddr>>,
}

impl Topology {
    pub fn add(&mut self, filter: Filter, server: SocketAddr) -> bool {
        self.entries.entry(filter).or_default().insert(server)
    }

    /// Removes the server wherever it is registered. Empty entries are
    /// pruned. Returns true if anything changed.
    pub fn remove_server(&mut self, server: SocketAddr) -> bool {
        let mut changed = false;
        self.entries.retain(|_, servers| {
            changed |= servers.remove(&server);
            !servers.is_empty()
        });
        changed
    }

    /// The sub-topology of servers whose registered filter covers `filter`.
    pub fn subset(&self, filter: &Filter) -> Topology {
        Topology {
            entries: self
                .entries
                .iter()
                .filter(|(f, _)| f.includes(filter))
                .map(|(f, s)| (f.clone(), s.clone()))
                .collect(),
        }
    }

    /// Deterministically picks one server able to satisfy `filter`: the
    /// smallest qualifying address not in `exclude`.
    pub fn best_server(
        &self,
        filter: &Filter,
        exclude: &BTreeSet<SocketAddr>,
    ) -> Option<SocketAddr> {
        self.entries
            .iter()
            .filter(|(f, _)| f.includes(filter))
            .flat_map(|(_, servers)| servers.iter())
            .filter(|s| !exclude.contains(s))
            .min()
            .copied()
    }

    pub fn servers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        let mut seen = BTreeSet::new();
        self.entries
            .values()
            .flatten()
            .copied()
            .filter(move |s| seen.insert(*s))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn filter(s: &str) -> Filter {
        s.parse().unwrap()
    }

    #[test]
    fn test_subset_and_best() {
        let mut t = Topology::default();
        t.add(filter("**"), addr(1));
        t.add(filter("DATA/"), addr(2));
        t.add(filter("OTHER/"), addr(3));

        let sub = t.subset(&filter("DATA/sub/"));
        assert_eq!(sub.servers().collect::<Vec<_>>(), vec![addr(1), addr(2)]);

        assert_eq!(t.best_server(&filter("DATA/"), &BTreeSet::new()), Some(addr(1)));
        let exclude = [addr(1)].into_iter().collect();
        assert_eq!(t.best_server(&filter("DATA/"), &exclude), Some(addr(2)));
        let exclude = [addr(1), addr(2)].into_iter().collect();
        assert_eq!(t.best_server(&filter("DATA/"), &exclude), None);
    }

    #[test]
    fn test_remove_prunes() {
        let mut t = Topology::default();
        t.add(filter("DATA/"), addr(2));
        assert!(t.remove_server(addr(2)));
        assert!(!t.remove_server(addr(2)));
        assert!(t.is_empty());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut t = Topology::default();
        assert!(t.add(filter("DATA/"), addr(2)));
        assert!(!t.add(filter("DATA/"), addr(2)));
    }
}

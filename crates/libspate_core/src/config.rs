use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Runtime knobs, constructed once at startup and passed by reference.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of simultaneously open archive file handles.
    pub active_file_cache_size: usize,

    /// Maximum concurrent server-checker probes at the tracker.
    pub max_server_checker_tasks: usize,

    /// How long an idle server-checker probe is allowed to take.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub server_checker_keepalive: Duration,

    /// Target number of upstream clients per filter.
    pub min_clients_per_filter: usize,

    /// Cadence of the client-manager control loop.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub client_replacement_period: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub client_keepalive: Duration,

    /// Per-read timeout on the three peer streams.
    #[serde_as(as = "serde_with::DurationMilliSeconds")]
    pub socket_timeout: Duration,

    pub nominal_remote_server_count: usize,

    /// How long a server stays in the "invalid" set before it becomes
    /// eligible for reconnection again.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub invalid_server_decay: Duration,

    /// Inclusive port range servers bind within; `None` lets the OS pick.
    pub server_port_range: Option<(u16, u16)>,

    /// Time-to-live stamped on locally published files, in seconds;
    /// negative means indefinite.
    pub default_time_to_live: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_file_cache_size: 512,
            max_server_checker_tasks: 16,
            server_checker_keepalive: Duration::from_secs(60),
            min_clients_per_filter: 8,
            client_replacement_period: Duration::from_secs(60),
            client_keepalive: Duration::from_secs(60),
            socket_timeout: Duration::from_millis(30_000),
            nominal_remote_server_count: 8,
            invalid_server_decay: Duration::from_secs(600),
            server_port_range: None,
            default_time_to_live: -1,
        }
    }
}

/// IANA-assigned default port for the tracker.
pub const DEFAULT_TRACKER_PORT: u16 = 38800;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.active_file_cache_size, 512);
        assert_eq!(c.min_clients_per_filter, 8);
        assert_eq!(c.socket_timeout, Duration::from_millis(30_000));
        assert!(c.server_port_range.is_none());
    }
}

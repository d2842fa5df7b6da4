use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use size_format::SizeFormatterBinary as SF;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use libspate::{Publisher, PublisherOptions, Subscriber, SubscriberOptions, Tracker};
use libspate_core::{
    Config, Filter, Predicate,
    config::DEFAULT_TRACKER_PORT,
    spawn_utils::spawn,
};

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_ERROR: i32 = 2;
const EXIT_INTERRUPTED: i32 = 3;

#[derive(Parser)]
#[command(version, about = "Peer-to-peer file distribution")]
struct Opts {
    /// The value for RUST_LOG if unset (e.g. "info", "libspate=debug").
    #[arg(long, default_value = "info", env = "SPATE_LOG")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the standalone tracker.
    Tracker {
        /// Address to listen on.
        #[arg(long, default_value_t = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TRACKER_PORT), env = "SPATE_TRACKER_LISTEN")]
        listen: SocketAddr,
    },

    /// Publish a directory tree, with a colocated tracker.
    Publish {
        /// Archive root to serve; files dropped into it are distributed.
        root: PathBuf,

        /// IP the data server binds (and advertises).
        #[arg(long, default_value = "0.0.0.0", env = "SPATE_LISTEN_IP")]
        listen_ip: IpAddr,

        /// Address of the colocated tracker.
        #[arg(long, default_value_t = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TRACKER_PORT), env = "SPATE_TRACKER_LISTEN")]
        tracker_listen: SocketAddr,

        /// Inclusive server port range, e.g. 39000-39050; OS-assigned if
        /// absent.
        #[arg(long, value_parser = parse_port_range)]
        port_range: Option<(u16, u16)>,

        /// Time-to-live for published files, e.g. 1h or 30m; files live
        /// forever if absent.
        #[arg(long, value_parser = parse_duration::parse)]
        time_to_live: Option<Duration>,
    },

    /// Subscribe to a publisher's data via its tracker.
    Subscribe {
        /// Local archive root to fill.
        root: PathBuf,

        /// The tracker to bootstrap from.
        #[arg(long, env = "SPATE_TRACKER")]
        tracker: SocketAddr,

        /// What to fetch: "**" for everything, "dir/" for a subtree, or an
        /// exact path. Repeatable. The subscription ends once every
        /// exact-path filter is satisfied.
        #[arg(long = "filter", default_value = "**")]
        filters: Vec<Filter>,

        /// IP the data server binds (and advertises).
        #[arg(long, default_value = "0.0.0.0", env = "SPATE_LISTEN_IP")]
        listen_ip: IpAddr,

        /// Target number of upstream servers per filter.
        #[arg(long, default_value_t = 8)]
        clients: usize,

        /// Cadence of upstream replacement, e.g. 60s.
        #[arg(long, default_value = "60s", value_parser = parse_duration::parse)]
        replacement_period: Duration,
    },
}

fn parse_port_range(s: &str) -> anyhow::Result<(u16, u16)> {
    let (lo, hi) = s
        .split_once('-')
        .with_context(|| format!("expected LOW-HIGH, got {s:?}"))?;
    let lo: u16 = lo.trim().parse().context("invalid low port")?;
    let hi: u16 = hi.trim().parse().context("invalid high port")?;
    if lo > hi {
        anyhow::bail!("empty port range {lo}-{hi}");
    }
    Ok((lo, hi))
}

fn init_logging(default: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_tracker(listen: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = Config::default();
    let (tracker, listener, udp) = Tracker::bind(listen, &config).await?;
    tracker.run(listener, udp, cancel).await
}

async fn run_publish(
    root: PathBuf,
    listen_ip: IpAddr,
    tracker_listen: SocketAddr,
    port_range: Option<(u16, u16)>,
    time_to_live: Option<Duration>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = Config {
        server_port_range: port_range,
        default_time_to_live: time_to_live.map_or(-1, |d| d.as_secs() as i64),
        ..Default::default()
    };
    let publisher = Publisher::start(
        PublisherOptions {
            root,
            listen_ip,
            tracker_listen,
            config,
        },
        cancel.clone(),
    )
    .await?;
    info!(
        server = %publisher.server_addr(),
        tracker = %publisher.tracker_addr(),
        "publishing"
    );
    cancel.cancelled().await;
    Ok(())
}

async fn run_subscribe(
    root: PathBuf,
    tracker: SocketAddr,
    filters: Vec<Filter>,
    listen_ip: IpAddr,
    clients: usize,
    replacement_period: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = Config {
        min_clients_per_filter: clients,
        client_replacement_period: replacement_period,
        ..Default::default()
    };
    let predicate = Predicate::from_filters(filters);
    if predicate.matches_nothing() {
        anyhow::bail!("subscription matches nothing");
    }
    let subscriber = Subscriber::start(
        SubscriberOptions {
            root,
            listen_ip,
            tracker_addr: tracker,
            predicate,
            config,
        },
        cancel.clone(),
    )
    .await?;
    info!(server = %subscriber.server_addr(), "subscribed");

    // Periodic progress, the way an operator wants to read it.
    {
        let clearing_house = subscriber.clearing_house().clone();
        let progress_cancel = cancel.clone();
        spawn(tracing::info_span!("progress"), async move {
            let mut last = (0u64, 0u64);
            loop {
                tokio::select! {
                    _ = progress_cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                let now = (
                    clearing_house.files_received(),
                    clearing_house.bytes_received(),
                );
                if now != last {
                    last = now;
                    info!("{} files received ({}B)", now.0, SF::new(now.1));
                }
            }
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = subscriber.wait_done() => {
            info!(
                files = subscriber.files_received(),
                "subscription satisfied"
            );
        }
    }
    Ok(())
}

fn main() {
    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            // Help and version are normal termination, not usage errors.
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_OK };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    init_logging(&opts.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("error starting runtime: {e:#}");
            std::process::exit(EXIT_ERROR);
        }
    };

    let code = runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let interrupted = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("interrupted, shutting down");
                cancel.cancel();
            })
        };

        let result = match opts.command {
            Command::Tracker { listen } => run_tracker(listen, cancel.clone()).await,
            Command::Publish {
                root,
                listen_ip,
                tracker_listen,
                port_range,
                time_to_live,
            } => {
                run_publish(
                    root,
                    listen_ip,
                    tracker_listen,
                    port_range,
                    time_to_live,
                    cancel.clone(),
                )
                .await
            }
            Command::Subscribe {
                root,
                tracker,
                filters,
                listen_ip,
                clients,
                replacement_period,
            } => {
                run_subscribe(
                    root,
                    tracker,
                    filters,
                    listen_ip,
                    clients,
                    replacement_period,
                    cancel.clone(),
                )
                .await
            }
        };

        match result {
            Ok(()) if cancel.is_cancelled() && interrupted.is_finished() => EXIT_INTERRUPTED,
            Ok(()) => EXIT_OK,
            Err(e) => {
                error!("{e:#}");
                EXIT_ERROR
            }
        }
    });
    std::process::exit(code);
}

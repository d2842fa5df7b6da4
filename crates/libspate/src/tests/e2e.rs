// End-to-end scenarios over real sockets on localhost: a publisher node,
// a few subscribers, and the tracker bootstrapping them into an overlay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::error_span;

use libspate_core::{Config, Filter, Predicate, spawn_utils::spawn};

use crate::archive::Archive;
use crate::clearing_house::ClearingHouse;
use crate::publisher::{Publisher, PublisherOptions, start_deletion_queue};
use crate::server::{Server, bind_listener};
use crate::subscriber::{Subscriber, SubscriberOptions};
use crate::tracker::Tracker;
use crate::tracker_files::DistributedTrackerFiles;
use crate::tracker_proxy::{TrackerProxy, admin_topology_path, encode_topology};

use super::test_util::*;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct PublisherNode {
    publisher: Publisher,
    cancel: CancellationToken,
    root: PathBuf,
    _dir: TempDir,
}

async fn start_publisher(config: Config) -> PublisherNode {
    let dir = TempDir::with_prefix("spate_pub").unwrap();
    let root = dir.path().join("archive");
    let cancel = CancellationToken::new();
    let publisher = Publisher::start(
        PublisherOptions {
            root: root.clone(),
            listen_ip: LOCALHOST,
            tracker_listen: (LOCALHOST, 0).into(),
            config,
        },
        cancel.clone(),
    )
    .await
    .unwrap();
    PublisherNode {
        publisher,
        cancel,
        root,
        _dir: dir,
    }
}

struct SubscriberNode {
    subscriber: Subscriber,
    cancel: CancellationToken,
    root: PathBuf,
    _dir: TempDir,
}

async fn start_subscriber(
    tracker_addr: SocketAddr,
    predicate: Predicate,
    config: Config,
) -> SubscriberNode {
    let dir = TempDir::with_prefix("spate_sub").unwrap();
    let root = dir.path().join("archive");
    start_subscriber_at(dir, root, tracker_addr, predicate, config).await
}

async fn start_subscriber_at(
    dir: TempDir,
    root: PathBuf,
    tracker_addr: SocketAddr,
    predicate: Predicate,
    config: Config,
) -> SubscriberNode {
    let cancel = CancellationToken::new();
    let subscriber = Subscriber::start(
        SubscriberOptions {
            root: root.clone(),
            listen_ip: LOCALHOST,
            tracker_addr,
            predicate,
            config,
        },
        cancel.clone(),
    )
    .await
    .unwrap();
    SubscriberNode {
        subscriber,
        cancel,
        root,
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_subscriber_static_content() {
    setup_test_logging();
    let config = test_config();
    let publisher = start_publisher(config.clone()).await;

    let big: Vec<u8> = b"two".repeat(200_000);
    write_file(&publisher.root, "DATA/a", b"one");
    write_file(&publisher.root, "DATA/b", &big);
    write_file(&publisher.root, "DATA/sub/c", b"three");

    let sub = start_subscriber(
        publisher.publisher.tracker_addr(),
        Predicate::everything(),
        config,
    )
    .await;

    let root = sub.root.clone();
    wait_until(
        || {
            file_has_contents(&root.join("DATA/a"), b"one")?;
            file_has_contents(&root.join("DATA/b"), &big)?;
            file_has_contents(&root.join("DATA/sub/c"), b"three")
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    sub.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_subscriber_receives_extant_files() {
    setup_test_logging();
    let config = test_config();
    let publisher = start_publisher(config.clone()).await;

    let contents: Vec<Vec<u8>> = (0..10).map(|n| random_bytes(1000 + n * 100)).collect();
    for (n, bytes) in contents.iter().enumerate() {
        write_file(&publisher.root, &format!("DATA/file{n}"), bytes);
    }
    // Let the publisher settle before anyone joins; the subscriber must
    // get everything from the handshake walk alone.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let sub = start_subscriber(
        publisher.publisher.tracker_addr(),
        Predicate::from_filters(["DATA/".parse::<Filter>().unwrap()]),
        config,
    )
    .await;

    let root = sub.root.clone();
    wait_until(
        || {
            for (n, bytes) in contents.iter().enumerate() {
                file_has_contents(&root.join(format!("DATA/file{n}")), bytes)?;
            }
            Ok(())
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    sub.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_to_peer_relay_survives_publisher_death() {
    setup_test_logging();
    let config = test_config();
    let publisher = start_publisher(config.clone()).await;

    let first = random_bytes(300_000);
    write_file(&publisher.root, "DATA/first", &first);

    let tracker = publisher.publisher.tracker_addr();
    let sub1 = start_subscriber(tracker, Predicate::everything(), config.clone()).await;
    let sub2 = start_subscriber(tracker, Predicate::everything(), config.clone()).await;

    let (r1, r2) = (sub1.root.clone(), sub2.root.clone());
    wait_until(
        || {
            file_has_contents(&r1.join("DATA/first"), &first)?;
            file_has_contents(&r2.join("DATA/first"), &first)
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    // Publish a second file and wait until one subscriber holds it, then
    // kill the publisher. The other subscriber can only get it relayed.
    let second = random_bytes(300_000);
    write_file(&publisher.root, "DATA/second", &second);
    let (c1, c2) = (r1.clone(), r2.clone());
    let sec = second.clone();
    wait_until(
        move || {
            file_has_contents(&c1.join("DATA/second"), &sec)
                .or_else(|_| file_has_contents(&c2.join("DATA/second"), &sec))
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();
    publisher.cancel.cancel();

    wait_until(
        || {
            file_has_contents(&r1.join("DATA/second"), &second)?;
            file_has_contents(&r2.join("DATA/second"), &second)?;
            // The first file stays reachable at both.
            file_has_contents(&r1.join("DATA/first"), &first)?;
            file_has_contents(&r2.join("DATA/first"), &first)
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    sub1.cancel.cancel();
    sub2.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upstream_count_recovers_after_subscriber_death() {
    setup_test_logging();
    let mut config = test_config();
    config.min_clients_per_filter = 2;
    let publisher = start_publisher(config.clone()).await;
    write_file(&publisher.root, "DATA/seed", &random_bytes(50_000));

    let tracker = publisher.publisher.tracker_addr();
    let sub1 = start_subscriber(tracker, Predicate::everything(), config.clone()).await;
    let sub2 = start_subscriber(tracker, Predicate::everything(), config.clone()).await;
    let sub3 = start_subscriber(tracker, Predicate::everything(), config.clone()).await;

    let survivors = [&sub1, &sub2];
    for sub in survivors {
        let ch = sub.subscriber.clearing_house().clone();
        wait_until(
            || {
                if ch.peer_count() >= 2 {
                    Ok(())
                } else {
                    anyhow::bail!("only {} peers", ch.peer_count())
                }
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    }

    sub3.cancel.cancel();
    tokio::time::sleep(2 * config.client_replacement_period).await;

    // Within a replacement period or two, every survivor is back at its
    // target upstream count.
    for sub in survivors {
        let ch = sub.subscriber.clearing_house().clone();
        wait_until(
            || {
                if ch.peer_count() >= 2 {
                    Ok(())
                } else {
                    anyhow::bail!("only {} peers", ch.peer_count())
                }
            },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    }

    sub1.cancel.cancel();
    sub2.cancel.cancel();
    publisher.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tracker_proxy_falls_back_to_archived_topology() {
    setup_test_logging();
    let config = test_config();
    let dir = TempDir::with_prefix("spate_proxy").unwrap();
    let archive = Archive::new(dir.path().join("archive"), &config).unwrap();

    // Nobody listens here; every fetch will fail.
    let dead_tracker: SocketAddr = (LOCALHOST, 9).into();
    let served: SocketAddr = (LOCALHOST, 40123).into();
    let mut topology = libspate_core::Topology::default();
    topology.add(Filter::Everything, served);
    archive
        .save(
            &admin_topology_path(dead_tracker),
            &encode_topology(&topology).unwrap(),
            -1,
        )
        .unwrap();

    let proxy = TrackerProxy::new(
        dead_tracker,
        (LOCALHOST, 40999).into(),
        Filter::Everything,
        archive.clone(),
        &config,
    );
    let got = proxy.topology(&Filter::Everything).await.unwrap();
    assert_eq!(
        got.best_server(&Filter::Everything, &Default::default()),
        Some(served)
    );

    // With neither tracker nor archived copy, subscribing has nothing to
    // stand on.
    let empty = Archive::new(dir.path().join("empty"), &config).unwrap();
    let proxy = TrackerProxy::new(
        dead_tracker,
        (LOCALHOST, 40999).into(),
        Filter::Everything,
        empty,
        &config,
    );
    assert!(matches!(
        proxy.topology(&Filter::Everything).await,
        Err(crate::error::Error::TopologyUnavailable)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_subscriber_joins_during_tracker_outage() {
    setup_test_logging();
    let config = test_config();

    // A hand-assembled publisher whose tracker can die independently.
    let tracker_cancel = CancellationToken::new();
    let (tracker, t_listener, t_udp) = Tracker::bind((LOCALHOST, 0).into(), &config)
        .await
        .unwrap();
    let tracker_addr = tracker.local_addr();
    spawn(
        error_span!("tracker"),
        tracker.clone().run(t_listener, t_udp, tracker_cancel.clone()),
    );

    let node_cancel = CancellationToken::new();
    let dir = TempDir::with_prefix("spate_pub").unwrap();
    let pub_root = dir.path().join("archive");
    let payload = random_bytes(100_000);
    write_file(&pub_root, "DATA/payload", &payload);

    let archive = Archive::new(&pub_root, &config).unwrap();
    start_deletion_queue(&archive, &node_cancel).unwrap();
    let clearing_house = ClearingHouse::new(archive.clone(), Predicate::nothing());
    let (listener, server_addr) = bind_listener(LOCALHOST, &config).await.unwrap();
    let server = Server::new(
        server_addr,
        Filter::Nothing,
        false,
        clearing_house.clone(),
        &config,
    );
    spawn(
        error_span!("server"),
        server.run(listener, node_cancel.clone()),
    );
    DistributedTrackerFiles::start(
        archive.clone(),
        tracker_addr,
        tracker.subscribe_topology(),
        node_cancel.clone(),
    );
    tracker.register(Filter::Everything, server_addr);
    // Give the distributed-files listener a moment to write the snapshot
    // that includes the registration.
    let topology_rel = admin_topology_path(tracker_addr).to_string();
    {
        let archive = archive.clone();
        let path = admin_topology_path(tracker_addr);
        wait_until(
            move || {
                let bytes = archive.restore(&path)?;
                let topology = crate::tracker_proxy::decode_topology(&bytes)?;
                if topology.servers().count() >= 1 {
                    Ok(())
                } else {
                    anyhow::bail!("topology file not yet populated")
                }
            },
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    }

    // First subscriber joins normally and receives, among everything, the
    // distributed topology file.
    let sub1 = start_subscriber(tracker_addr, Predicate::everything(), config.clone()).await;
    let (r1, payload_check) = (sub1.root.clone(), payload.clone());
    let topology_check = topology_rel.clone();
    wait_until(
        move || {
            file_has_contents(&r1.join("DATA/payload"), &payload_check)?;
            if r1.join(&topology_check).exists() {
                Ok(())
            } else {
                anyhow::bail!("no topology file yet")
            }
        },
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    // Tracker goes away. A new subscriber whose archive carries the
    // distributed topology (here: restored from the first subscriber's)
    // still bootstraps and makes progress.
    tracker_cancel.cancel();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dir2 = TempDir::with_prefix("spate_sub").unwrap();
    let root2 = dir2.path().join("archive");
    let topology_rel = admin_topology_path(tracker_addr).to_string();
    let src = sub1.root.join(&topology_rel);
    let dst = root2.join(&topology_rel);
    std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
    std::fs::copy(&src, &dst).unwrap();

    let sub2 =
        start_subscriber_at(dir2, root2, tracker_addr, Predicate::everything(), config).await;
    let r2 = sub2.root.clone();
    wait_until(
        || file_has_contents(&r2.join("DATA/payload"), &payload),
        Duration::from_secs(30),
    )
    .await
    .unwrap();

    sub1.cancel.cancel();
    sub2.cancel.cancel();
    node_cancel.cancel();
}

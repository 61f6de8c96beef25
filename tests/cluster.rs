//! End-to-end cluster tests: a coordinator plus three in-process server
//! nodes, each on its own runtime so a crash-stop failure can be simulated
//! by tearing that runtime down. The coordinator runs with spawning
//! disabled and the test plays the role of the process spawner, starting a
//! replacement node when recovery expects one.

use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use shardkv::{
    key_from_bytes, key_owner, locate, one_shot_op, secondary_of,
    ClusterConfig, Coordinator, Key, KvClient, KvServerNode, OpRequest,
    OpStatus, ServerId, MAX_VALUE_SIZE,
};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POPULATION: u8 = 3;

/// Opt-in logging for debugging test runs (`RUST_LOG=debug cargo test`).
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cluster configuration text for three localhost servers with ports laid
/// out as `base + 10*sid + {0,1,2}` (client, peer, ctrl).
fn cluster_text(base: u16) -> String {
    let mut text = format!("{}\n", POPULATION);
    for sid in 0..POPULATION {
        let port = base + 10 * sid as u16;
        text += &format!("localhost {} {} {}\n", port, port + 1, port + 2);
    }
    text
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn client_port_of(base: u16, sid: ServerId) -> u16 {
    base + 10 * sid as u16
}

/// Finds a key owned by the given shard, derived from a readable tag.
fn key_owned_by(owner: ServerId, tag: &str) -> Key {
    for salt in 0..10_000u32 {
        let key = key_from_bytes(format!("{}-{}", tag, salt).as_bytes());
        if key_owner(&key, POPULATION) == owner {
            return key;
        }
    }
    panic!("no key hashing to shard {} found", owner);
}

/// One simulated server process.
struct TestServer {
    runtime: Option<Runtime>,
    handle: JoinHandle<()>,
    _tx_term: watch::Sender<bool>,
}

impl TestServer {
    /// Crash-stop: tearing the runtime down kills every task and socket of
    /// this server at once.
    fn crash(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn start_server(sid: ServerId, base: u16, coord_srv_port: u16) -> TestServer {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name(format!("test-server{}", sid))
        .build()
        .unwrap();
    let (tx_term, rx_term) = watch::channel(false);

    let port = base + 10 * sid as u16;
    let handle = runtime.spawn(async move {
        let mut node = KvServerNode::new_and_setup(
            sid,
            POPULATION,
            addr(port),
            addr(port + 1),
            addr(port + 2),
            addr(coord_srv_port),
            Some("heartbeat_interval_ms = 100"),
        )
        .await
        .expect("server setup should succeed");
        node.run(rx_term).await.expect("server run should not fail");
    });

    TestServer {
        runtime: Some(runtime),
        handle,
        _tx_term: tx_term,
    }
}

/// The simulated coordinator process.
struct TestCoord {
    runtime: Option<Runtime>,
    tx_term: watch::Sender<bool>,
    done_rx: std_mpsc::Receiver<Result<(), String>>,
}

impl TestCoord {
    fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn start_coord(
    base: u16,
    srv_port: u16,
    cli_port: u16,
    ready_tx: std_mpsc::Sender<()>,
) -> TestCoord {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("test-coord")
        .build()
        .unwrap();
    let (tx_term, rx_term) = watch::channel(false);
    let (done_tx, done_rx) = std_mpsc::channel();

    let text = cluster_text(base);
    runtime.spawn(async move {
        let result = async {
            let cluster = ClusterConfig::parse(&text)?;
            let mut coordinator = Coordinator::new_and_setup(
                addr(srv_port),
                addr(cli_port),
                cluster,
                Duration::from_millis(700),
                Some(
                    "tick_interval_ms = 100\n\
                     spawn_servers = false\n\
                     shutdown_grace_ms = 1000",
                ),
            )
            .await?;
            let _ = ready_tx.send(());
            coordinator.run(rx_term).await
        }
        .await;
        let _ = done_tx.send(result.map_err(|e| e.to_string()));
    });

    TestCoord {
        runtime: Some(runtime),
        tx_term,
        done_rx,
    }
}

fn client_runtime() -> Runtime {
    Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("test-client")
        .build()
        .unwrap()
}

fn teardown(mut coord: TestCoord, servers: &mut [TestServer]) {
    let _ = coord.tx_term.send(true);
    let _ = coord.done_rx.recv_timeout(Duration::from_secs(15));
    coord.stop();
    for server in servers {
        server.crash();
    }
}

#[test]
fn basic_replication() {
    init_logging();
    let (base, srv_port, cli_port) = (47500, 47590, 47591);
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let coord = start_coord(base, srv_port, cli_port, ready_tx);
    let mut servers: Vec<TestServer> = (0..POPULATION)
        .map(|sid| start_server(sid, base, srv_port))
        .collect();
    ready_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("cluster should come up");

    let rt = client_runtime();
    rt.block_on(async {
        let client = KvClient::new(addr(cli_port));
        let apple = key_from_bytes(b"apple");

        // a successful PUT is visible through the coordinator's routing
        let reply = client.put(&apple, b"red".to_vec()).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        let reply = client.get(&apple).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        assert_eq!(reply.value.unwrap(), b"red".to_vec());

        // and at the replica copy held by the owner's secondary
        let owner = key_owner(&apple, POPULATION);
        let backup = secondary_of(owner, POPULATION);
        let reply = one_shot_op(
            addr(client_port_of(base, backup)),
            &OpRequest::Get { key: apple },
        )
        .await
        .unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        assert_eq!(reply.value.unwrap(), b"red".to_vec());

        // unknown keys are not-found, not failures
        let reply = client.get(&key_from_bytes(b"never-put")).await.unwrap();
        assert_eq!(reply.status, OpStatus::KeyNotFound);

        // a PUT addressed at a server that neither owns nor backs the key
        // is refused
        let third = (0..POPULATION)
            .find(|sid| *sid != owner && *sid != backup)
            .unwrap();
        let reply = one_shot_op(
            addr(client_port_of(base, third)),
            &OpRequest::Put {
                key: apple,
                value: b"blue".to_vec(),
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.status, OpStatus::ServerFailure);

        // oversize values are refused and leave the tables unchanged
        let big_key = key_from_bytes(b"big");
        let big_owner = key_owner(&big_key, POPULATION);
        let reply = one_shot_op(
            addr(client_port_of(base, big_owner)),
            &OpRequest::Put {
                key: big_key,
                value: vec![0xcd; MAX_VALUE_SIZE + 1],
            },
        )
        .await
        .unwrap();
        assert_eq!(reply.status, OpStatus::ServerFailure);
        let reply = client.get(&big_key).await.unwrap();
        assert_eq!(reply.status, OpStatus::KeyNotFound);

        // repeating a PUT leaves the same final state
        let reply = client.put(&apple, b"red".to_vec()).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        let reply = client.get(&apple).await.unwrap();
        assert_eq!(reply.value.unwrap(), b"red".to_vec());

        // concurrent writers on one key: exactly one ordering wins and
        // both copies agree on it
        let kx = key_from_bytes(b"kx");
        let writer_a = KvClient::new(addr(cli_port));
        let writer_b = KvClient::new(addr(cli_port));
        let (ra, rb) = tokio::join!(
            writer_a.put(&kx, b"aaa".to_vec()),
            writer_b.put(&kx, b"bbb".to_vec()),
        );
        assert_eq!(ra.unwrap().status, OpStatus::Success);
        assert_eq!(rb.unwrap().status, OpStatus::Success);
        let at_owner = client.get(&kx).await.unwrap().value.unwrap();
        let kx_backup = secondary_of(key_owner(&kx, POPULATION), POPULATION);
        let at_backup = one_shot_op(
            addr(client_port_of(base, kx_backup)),
            &OpRequest::Get { key: kx },
        )
        .await
        .unwrap()
        .value
        .unwrap();
        assert_eq!(at_owner, at_backup);
        assert!(at_owner == b"aaa".to_vec() || at_owner == b"bbb".to_vec());
    });

    teardown(coord, &mut servers);
}

#[test]
fn crash_and_recovery() {
    init_logging();
    let (base, srv_port, cli_port) = (47600, 47690, 47691);
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let coord = start_coord(base, srv_port, cli_port, ready_tx);
    let mut servers: Vec<TestServer> = (0..POPULATION)
        .map(|sid| start_server(sid, base, srv_port))
        .collect();
    ready_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("cluster should come up");

    let rt = client_runtime();
    let k1 = key_owned_by(0, "k1");
    let k0 = key_owned_by(0, "k0");

    rt.block_on(async {
        let client = KvClient::new(addr(cli_port));
        let reply = client.put(&k1, b"v1".to_vec()).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
    });

    // crash the owner of the k* keyspace
    servers[0].crash();

    // the coordinator must detect the silence and redirect the keyspace to
    // the surviving secondary
    rt.block_on(async {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if let Ok(resp) = locate(addr(cli_port), &k1).await {
                if resp.port == client_port_of(base, 1) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "failure was never detected");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    // start the replacement; the coordinator drives both rebuild streams
    servers[0] = start_server(0, base, srv_port);

    // a write to the failed shard succeeds while recovery is in flight,
    // served by the interim primary (or by the replacement if the switch
    // already finished)
    rt.block_on(async {
        let client = KvClient::new(addr(cli_port)).with_retries(50);
        let reply = client.put(&k0, b"v0".to_vec()).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
    });

    // the switch completes: the keyspace routes back to the replacement
    rt.block_on(async {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if let Ok(resp) = locate(addr(cli_port), &k1).await {
                if resp.port == client_port_of(base, 0) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "recovery never completed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // everything written before and during recovery is served by the
        // replacement with no data loss
        let client = KvClient::new(addr(cli_port));
        let reply = client.get(&k1).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        assert_eq!(reply.value.unwrap(), b"v1".to_vec());
        let reply = client.get(&k0).await.unwrap();
        assert_eq!(reply.status, OpStatus::Success);
        assert_eq!(reply.value.unwrap(), b"v0".to_vec());

        // and the surviving secondary's replica copies agree
        let reply = one_shot_op(
            addr(client_port_of(base, 1)),
            &OpRequest::Get { key: k1 },
        )
        .await
        .unwrap();
        assert_eq!(reply.value.unwrap(), b"v1".to_vec());
        let reply = one_shot_op(
            addr(client_port_of(base, 1)),
            &OpRequest::Get { key: k0 },
        )
        .await
        .unwrap();
        assert_eq!(reply.value.unwrap(), b"v0".to_vec());
    });

    teardown(coord, &mut servers);
}

#[test]
fn graceful_shutdown() {
    init_logging();
    let (base, srv_port, cli_port) = (47700, 47790, 47791);
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let mut coord = start_coord(base, srv_port, cli_port, ready_tx);
    let mut servers: Vec<TestServer> = (0..POPULATION)
        .map(|sid| start_server(sid, base, srv_port))
        .collect();
    ready_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("cluster should come up");

    // request shutdown; the coordinator sends SHUTDOWN to every server and
    // returns cleanly
    coord.tx_term.send(true).unwrap();
    let result = coord
        .done_rx
        .recv_timeout(Duration::from_secs(15))
        .expect("coordinator should exit");
    assert!(result.is_ok(), "coordinator exited with: {:?}", result);

    // every server's run loop returns once its shutdown command lands
    let deadline = Instant::now() + Duration::from_secs(10);
    while !servers.iter().all(|server| server.handle.is_finished()) {
        assert!(Instant::now() < deadline, "servers did not exit in time");
        std::thread::sleep(Duration::from_millis(100));
    }

    coord.stop();
    for server in &mut servers {
        server.crash();
    }
}

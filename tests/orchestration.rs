//! Cross-module orchestration scenarios.
//!
//! Everything here runs without the real `quill_daemon`: RPC goes through a
//! recording stub transport and the launch tests drive a scripted stand-in
//! executable that prints the startup milestones and then idles.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use quill_testnet::node::{
    CHAIN_ADVANCE_MILESTONE, P2P_READY_MILESTONE, RPC_READY_MILESTONE, WS_READY_MILESTONE,
};
use quill_testnet::{
    allocate_port, CleanupPolicy, LaunchOptions, NodeState, RpcTransport, TestNetwork, TestNode,
    TestnetError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records every request and answers with a fixed success.
#[derive(Default)]
struct RecordingTransport {
    requests: Mutex<Vec<(String, Value)>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls_of(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|(_, body)| body["method"] == method)
            .map(|(_, body)| body["params"].clone())
            .collect()
    }
}

#[async_trait]
impl RpcTransport for RecordingTransport {
    async fn roundtrip(&self, endpoint: &str, body: &Value) -> anyhow::Result<Value> {
        self.requests
            .lock()
            .push((endpoint.to_string(), body.clone()));
        Ok(json!({ "jsonrpc": "2.0", "id": 1, "result": true }))
    }
}

/// Reports a head number that grows by one on every query.
#[derive(Default)]
struct GrowingHeadTransport {
    calls: Mutex<u64>,
}

#[async_trait]
impl RpcTransport for GrowingHeadTransport {
    async fn roundtrip(&self, _endpoint: &str, _body: &Value) -> anyhow::Result<Value> {
        let mut calls = self.calls.lock();
        *calls += 1;
        Ok(json!({ "jsonrpc": "2.0", "id": 1, "result": { "height": *calls } }))
    }
}

fn stub_network(name: &str, base: &Path, nodes: &[&str], transport: Arc<dyn RpcTransport>) -> TestNetwork {
    let mut network = TestNetwork::new(name, base.join(name));
    for node_name in nodes {
        let node = network.add_node(node_name).unwrap();
        node.set_transport(transport.clone());
        node.ensure_endpoints().unwrap();
    }
    network
}

/// Write a shell script that behaves like a devnet daemon build: answers
/// `--version` with the devnet marker, prints the startup milestones to
/// stderr and then idles until it is interrupted.
fn scripted_daemon(dir: &Path) -> PathBuf {
    let path = dir.join("quill_daemon");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        "#!/bin/sh\n\
         if [ \"$1\" = \"--version\" ]; then echo 'quill_daemon 0.1.0 (devnet-build)'; exit 0; fi\n\
         echo '{} 127.0.0.1:0' >&2\n\
         echo '{} 127.0.0.1:0' >&2\n\
         echo '{} 127.0.0.1:0' >&2\n\
         echo '{} 1' >&2\n\
         exec sleep 600\n",
        P2P_READY_MILESTONE, RPC_READY_MILESTONE, WS_READY_MILESTONE, CHAIN_ADVANCE_MILESTONE
    )
    .unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Like `scripted_daemon`, but the process dies right after starting.
fn crashing_daemon(dir: &Path) -> PathBuf {
    let path = dir.join("quill_daemon_crash");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        "#!/bin/sh\n\
         if [ \"$1\" = \"--version\" ]; then echo 'quill_daemon 0.1.0 (devnet-build)'; exit 0; fi\n\
         echo 'failed to open database' >&2\n\
         exit 1\n"
    )
    .unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

#[test]
fn sequential_leases_are_ordered_and_distinct() {
    let first = allocate_port().unwrap();
    let second = allocate_port().unwrap();
    assert!(second > first);
}

// ---------------------------------------------------------------------------
// Seed wiring
// ---------------------------------------------------------------------------

#[test]
fn followers_are_wired_to_the_first_member_only() {
    let base = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let mut network = stub_network("alpha", base.path(), &["m0", "m1", "m2"], transport);

    network.wire_seed_nodes().unwrap();

    let seed_port = network.nodes()[0].peer_address().unwrap();
    assert!(network.nodes()[0].config().seed_nodes.is_empty());
    for follower in &network.nodes()[1..] {
        assert_eq!(follower.config().seed_nodes, vec![seed_port.clone()]);
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn partition_state_is_symmetric_across_a_cycle() {
    let base = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let mut alpha = stub_network("alpha", base.path(), &["a0"], transport.clone());
    let mut beta = stub_network("beta", base.path(), &["b0"], transport.clone());

    alpha.disconnect_from(&mut beta).await.unwrap();
    assert!(alpha.partitioned_from("beta"));
    assert!(beta.partitioned_from("alpha"));

    alpha.connect_with(&mut beta).await.unwrap();
    assert!(!alpha.partitioned_from("beta"));
    assert!(!beta.partitioned_from("alpha"));

    // One restriction and one lift per node.
    assert_eq!(transport.calls_of("set_allowed_peers").len(), 4);
}

#[tokio::test]
async fn disconnect_restricts_members_to_topology_mates() {
    let base = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let mut alpha = stub_network("alpha", base.path(), &["a0", "a1"], transport.clone());
    let mut beta = stub_network("beta", base.path(), &["b0"], transport.clone());

    alpha.disconnect_from(&mut beta).await.unwrap();

    let calls = transport.calls_of("set_allowed_peers");
    assert_eq!(calls.len(), 3);

    let a0 = alpha.node("a0").unwrap().peer_address().unwrap();
    let a1 = alpha.node("a1").unwrap().peer_address().unwrap();
    // a0 may only see a1 and vice versa; the lone b0 gets an empty list.
    assert_eq!(calls[0]["peers"], json!([a1]));
    assert_eq!(calls[1]["peers"], json!([a0]));
    assert_eq!(calls[2]["peers"], json!([]));
}

#[tokio::test]
async fn repartitioning_before_rejoin_is_rejected() {
    let base = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let mut alpha = stub_network("alpha", base.path(), &["a0"], transport.clone());
    let mut beta = stub_network("beta", base.path(), &["b0"], transport);

    alpha.disconnect_from(&mut beta).await.unwrap();
    let err = alpha.disconnect_from(&mut beta).await.unwrap_err();
    assert!(matches!(err, TestnetError::AlreadyPartitioned { .. }));
}

// ---------------------------------------------------------------------------
// Block waiters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn block_waiter_polls_until_the_target_head() {
    let base = tempfile::tempdir().unwrap();
    let mut node = TestNode::new("alpha", base.path().join("alpha"));
    node.set_transport(Arc::new(GrowingHeadTransport::default()));
    node.ensure_endpoints().unwrap();

    assert_eq!(node.head_block_number().await.unwrap(), 1);
    // Head grows by one per query, so this needs exactly one more poll.
    node.wait_for_block_number(2, Some(Duration::from_secs(30)))
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Launch lifecycle against a scripted daemon
// ---------------------------------------------------------------------------

#[tokio::test]
async fn launch_reaches_live_and_close_reaps_the_child() {
    init_logging();
    let base = tempfile::tempdir().unwrap();
    let script = scripted_daemon(base.path());

    let mut node = TestNode::new("alpha", base.path().join("alpha"));
    node.set_executable(&script);
    node.launch(LaunchOptions {
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    })
    .await
    .unwrap();

    assert_eq!(node.state(), NodeState::Live);
    assert!(node.is_running());
    assert!(node.is_reachable_ws().await);
    assert!(node.directory().join("config.json").is_file());

    node.close();
    assert_eq!(node.state(), NodeState::Closed);
    assert!(!node.is_running());
}

#[tokio::test]
async fn a_crashing_daemon_is_reported_not_hung() {
    let base = tempfile::tempdir().unwrap();
    let script = crashing_daemon(base.path());

    let mut node = TestNode::new("alpha", base.path().join("alpha"));
    node.set_executable(&script);
    let err = node
        .launch(LaunchOptions {
            timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TestnetError::CrashedOnLaunch { .. }));
    assert_eq!(node.state(), NodeState::CrashedOnLaunch);
}

#[tokio::test]
async fn relaunch_with_reused_config_leaves_the_file_untouched() {
    let base = tempfile::tempdir().unwrap();
    let script = scripted_daemon(base.path());

    let mut node = TestNode::new("alpha", base.path().join("alpha"));
    node.set_executable(&script);
    node.launch(LaunchOptions {
        wait_for_live: false,
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    })
    .await
    .unwrap();
    node.close();

    let config_path = node.directory().join("config.json");
    let before = std::fs::read_to_string(&config_path).unwrap();

    // Survives the relaunch because only the first launch wipes the
    // directory; with reuse_existing_config the file is read back, not
    // rewritten.
    let marker = node.directory().join("chain-state.marker");
    std::fs::write(&marker, "x").unwrap();

    node.launch(LaunchOptions {
        wait_for_live: false,
        timeout: Some(Duration::from_secs(30)),
        reuse_existing_config: true,
        ..Default::default()
    })
    .await
    .unwrap();
    node.close();

    let after = std::fs::read_to_string(&config_path).unwrap();
    assert_eq!(before, after);
    assert!(marker.is_file());
}

#[tokio::test]
async fn first_launch_discards_leftover_state() {
    let base = tempfile::tempdir().unwrap();
    let script = scripted_daemon(base.path());

    let node_dir = base.path().join("alpha");
    std::fs::create_dir_all(&node_dir).unwrap();
    let leftover = node_dir.join("stale.lock");
    std::fs::write(&leftover, "x").unwrap();

    let mut node = TestNode::new("alpha", &node_dir);
    node.set_executable(&script);
    node.launch(LaunchOptions {
        wait_for_live: false,
        timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    })
    .await
    .unwrap();
    node.close();

    assert!(!leftover.exists());
}

#[tokio::test]
async fn network_launch_starts_members_in_order_and_teardown_cleans_up() {
    init_logging();
    let base = tempfile::tempdir().unwrap();
    let script = scripted_daemon(base.path());

    let mut network = TestNetwork::new("alpha", base.path().join("alpha"));
    for name in ["m0", "m1", "m2"] {
        network.add_node(name).unwrap().set_executable(&script);
    }

    network.launch(false).await.unwrap();
    assert!(network.is_running());
    for node in network.nodes() {
        assert!(node.is_running());
        assert!(node.is_reachable_p2p().await);
    }

    // The written configs carry the wiring: m1 and m2 list m0 as their seed,
    // m0 lists nobody.
    let seed_address = network.nodes()[0].peer_address().unwrap();
    for node in &network.nodes()[1..] {
        let on_disk =
            quill_testnet::NodeConfig::load_from_file(&node.directory().join("config.json"))
                .unwrap();
        assert_eq!(on_disk.seed_nodes, vec![seed_address.clone()]);
    }
    let seed_config =
        quill_testnet::NodeConfig::load_from_file(&network.nodes()[0].directory().join("config.json"))
            .unwrap();
    assert!(seed_config.seed_nodes.is_empty());
    // Members cannot join a running network.
    let err = network.add_node("late").unwrap_err();
    assert!(matches!(err, TestnetError::MembersLocked { .. }));

    network.teardown(CleanupPolicy::RemoveEverything).unwrap();
    assert!(!network.directory().exists());
}

#[tokio::test]
async fn disposable_cleanup_keeps_config_files() {
    let base = tempfile::tempdir().unwrap();
    let script = scripted_daemon(base.path());

    let mut network = TestNetwork::new("alpha", base.path().join("alpha"));
    network.add_node("m0").unwrap().set_executable(&script);

    network.launch(false).await.unwrap();
    network
        .teardown(CleanupPolicy::RemoveDisposableFiles)
        .unwrap();

    let node_dir = network.nodes()[0].directory();
    assert!(node_dir.join("config.json").is_file());
    assert!(!node_dir.join("stderr.log").exists());
}

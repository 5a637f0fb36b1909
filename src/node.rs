//! One daemon instance and its full lifecycle.
//!
//! A [`TestNode`] owns the working directory, the on-disk configuration, the
//! spawned `quill_daemon` process and its log files. The lifecycle runs
//! `Unconfigured → Configured → Launching → Reachable → Live → Closed`;
//! a child that dies while the harness is still waiting for its startup
//! milestones lands in `CrashedOnLaunch` instead.
//!
//! Readiness is observed the same way an operator would: by watching the
//! daemon's stderr stream for its startup lines. The exact phrases below are
//! therefore part of the contract with the executable.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use crate::config::{NodeConfig, CONFIG_FILE_NAME};
use crate::error::{TestnetError, TestnetResult};
use crate::exec::{self, Executable};
use crate::ports::allocate_port;
use crate::process::shutdown_child;
use crate::rpc::{RpcClient, RpcTransport};

/// Chain identifier every devnet node is started with.
pub const DEVNET_CHAIN_ID: &str = "quill-devnet";

/// Printed once the peer-to-peer listener is bound.
pub const P2P_READY_MILESTONE: &str = "P2P server listening on";
/// Printed once the HTTP JSON-RPC listener is bound.
pub const RPC_READY_MILESTONE: &str = "Starting RPC server on";
/// Printed once the WebSocket endpoint is bound.
pub const WS_READY_MILESTONE: &str = "WebSocket endpoint enabled on";
/// Printed every time the node adopts a new head block, whether it produced
/// the block itself or received it from a peer.
pub const CHAIN_ADVANCE_MILESTONE: &str = "chain head advanced to";

/// Interval between consecutive scans of the stderr log.
const MILESTONE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Interval while waiting for a daemon-produced config file.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Bound on that wait.
const CONFIG_WAIT_LIMIT: Duration = Duration::from_secs(10);
/// Interval between head-number queries in the block waiters.
pub const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconfigured,
    Configured,
    Launching,
    /// Listeners are bound but the chain head has not moved yet.
    Reachable,
    Live,
    Closed,
    CrashedOnLaunch,
}

/// Knobs for [`TestNode::launch`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Block until the node is producing or receiving blocks.
    pub wait_for_live: bool,
    /// Overall deadline for the startup waits; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Keep the config file already on disk instead of writing a fresh one.
    pub reuse_existing_config: bool,
    /// Inherit the parent's stdio instead of redirecting to log files.
    pub passthrough_io: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            wait_for_live: true,
            timeout: None,
            reuse_existing_config: false,
            passthrough_io: false,
        }
    }
}

pub struct TestNode {
    name: String,
    directory: PathBuf,
    config: NodeConfig,
    state: NodeState,
    child: Option<Child>,
    executable: Option<PathBuf>,
    transport: Option<Arc<dyn RpcTransport>>,
    rpc: Option<RpcClient>,
    launched: bool,
}

impl TestNode {
    /// A fresh, unconfigured node rooted at `directory`.
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            config: NodeConfig::default(),
            state: NodeState::Unconfigured,
            child: None,
            executable: None,
            transport: None,
            rpc: None,
            launched: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut NodeConfig {
        &mut self.config
    }

    /// Pid of the spawned daemon, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Use this binary instead of walking the discovery chain.
    pub fn set_executable(&mut self, path: impl Into<PathBuf>) {
        self.executable = Some(path.into());
    }

    /// Route this node's RPC traffic through a caller-supplied transport.
    /// Meant for tests that stub out the HTTP layer.
    pub fn set_transport(&mut self, transport: Arc<dyn RpcTransport>) {
        self.transport = Some(transport);
        self.rpc = None;
        // Rebuild eagerly when the endpoint is already known.
        if self.config.rpc_bind_address.is_some() {
            self.rpc = self.make_rpc_client().ok().flatten();
        }
    }

    pub fn stdout_log_path(&self) -> PathBuf {
        self.directory.join("stdout.log")
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.directory.join("stderr.log")
    }

    /// The address peers should dial, rewritten to loopback.
    pub fn peer_address(&self) -> Option<String> {
        let address = self.config.p2p_bind_address.as_deref()?;
        let port = address.rsplit(':').next()?;
        Some(format!("127.0.0.1:{}", port))
    }

    /// Fill in any endpoint the caller left unset, leasing fresh ports.
    pub fn ensure_endpoints(&mut self) -> TestnetResult<()> {
        if self.config.p2p_bind_address.is_none() {
            self.config.p2p_bind_address = Some(format!("127.0.0.1:{}", allocate_port()?));
        }
        if self.config.rpc_bind_address.is_none() {
            self.config.rpc_bind_address = Some(format!("127.0.0.1:{}", allocate_port()?));
        }
        if self.config.ws_bind_address.is_none() {
            self.config.ws_bind_address = Some(format!("127.0.0.1:{}", allocate_port()?));
        }
        if self.rpc.is_none() {
            self.rpc = self.make_rpc_client()?;
        }
        if self.state == NodeState::Unconfigured {
            self.state = NodeState::Configured;
        }
        Ok(())
    }

    /// Assign `other` a P2P endpoint if it has none yet, then record it as a
    /// seed contact of this node.
    pub fn add_seed_node(&mut self, other: &mut TestNode) -> TestnetResult<()> {
        if other.config.p2p_bind_address.is_none() {
            other.config.p2p_bind_address = Some(format!("127.0.0.1:{}", allocate_port()?));
            if other.state == NodeState::Unconfigured {
                other.state = NodeState::Configured;
            }
        }
        let seed = other
            .peer_address()
            .ok_or_else(|| TestnetError::EndpointUnset {
                name: other.name.clone(),
                endpoint: "p2p",
            })?;
        if !self.config.seed_nodes.contains(&seed) {
            self.config.seed_nodes.push(seed);
        }
        Ok(())
    }

    /// Start the daemon.
    ///
    /// Resolves and vets the executable, prepares the working directory and
    /// configuration, spawns the process with its stdio redirected to the
    /// per-node log files, then optionally waits for liveness. The first
    /// launch discards any leftover working directory; later launches keep
    /// it so the node resumes its previous chain state.
    pub async fn launch(&mut self, options: LaunchOptions) -> TestnetResult<()> {
        let path = exec::resolve_executable(Executable::Daemon, self.executable.as_deref())?;
        exec::ensure_devnet_build(&path, Executable::Daemon).await?;

        if !self.launched && self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
        }
        fs::create_dir_all(&self.directory)?;

        let config_path = self.directory.join(CONFIG_FILE_NAME);
        if options.reuse_existing_config {
            self.config = wait_for_config_file(&config_path).await?;
        } else {
            self.ensure_endpoints()?;
            self.config.write_to_file(&config_path)?;
        }
        if self.rpc.is_none() {
            self.rpc = self.make_rpc_client()?;
        }

        let mut command = Command::new(&path);
        command
            .arg(format!("--chain-id={}", DEVNET_CHAIN_ID))
            .arg("-d")
            .arg(&self.directory);
        if options.passthrough_io {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command
                .stdout(Stdio::from(File::create(self.stdout_log_path())?))
                .stderr(Stdio::from(File::create(self.stderr_log_path())?));
        }

        self.state = NodeState::Launching;
        let child = command.spawn()?;
        info!(
            "launched node {} (pid {:?}) from {:?}",
            self.name,
            child.id(),
            path
        );
        self.child = Some(child);
        self.launched = true;

        if options.wait_for_live {
            self.wait_until_live(options.timeout).await?;
        }
        Ok(())
    }

    fn make_rpc_client(&self) -> TestnetResult<Option<RpcClient>> {
        let Some(address) = self.config.rpc_bind_address.as_deref() else {
            return Ok(None);
        };
        let endpoint = format!("http://{}/json_rpc", address);
        let client = match &self.transport {
            Some(transport) => RpcClient::with_transport(endpoint, transport.clone()),
            None => RpcClient::new(endpoint)?,
        };
        Ok(Some(client))
    }

    fn rpc_client(&self) -> TestnetResult<&RpcClient> {
        self.rpc.as_ref().ok_or_else(|| TestnetError::EndpointUnset {
            name: self.name.clone(),
            endpoint: "rpc",
        })
    }

    /// Raw substring probe against the node's stderr log. The milestone
    /// predicates below are built from this; exposed because tests and
    /// debugging sessions want it too.
    pub async fn log_contains(&self, needle: &str) -> bool {
        match tokio::fs::read_to_string(self.stderr_log_path()).await {
            Ok(contents) => contents.contains(needle),
            Err(_) => false,
        }
    }

    pub async fn is_reachable_p2p(&self) -> bool {
        self.log_contains(P2P_READY_MILESTONE).await
    }

    pub async fn is_reachable_rpc(&self) -> bool {
        self.log_contains(RPC_READY_MILESTONE).await
    }

    pub async fn is_reachable_ws(&self) -> bool {
        self.log_contains(WS_READY_MILESTONE).await
    }

    pub async fn is_live(&self) -> bool {
        self.log_contains(CHAIN_ADVANCE_MILESTONE).await
    }

    /// Wait until the P2P listener is bound. Used between member launches so
    /// the next node never dials a seed that is not accepting yet.
    pub async fn wait_until_p2p_reachable(&mut self, timeout: Option<Duration>) -> TestnetResult<()> {
        let deadline = deadline_from(timeout);
        self.wait_for_milestone(P2P_READY_MILESTONE, "p2p listener", deadline)
            .await
    }

    /// Wait until both network listeners are bound.
    pub async fn wait_until_reachable(&mut self, timeout: Option<Duration>) -> TestnetResult<()> {
        let deadline = deadline_from(timeout);
        self.wait_for_milestone(P2P_READY_MILESTONE, "p2p listener", deadline)
            .await?;
        self.wait_for_milestone(RPC_READY_MILESTONE, "rpc listener", deadline)
            .await?;
        if self.state == NodeState::Launching {
            self.state = NodeState::Reachable;
        }
        Ok(())
    }

    /// Wait until the node is producing or receiving blocks.
    pub async fn wait_until_live(&mut self, timeout: Option<Duration>) -> TestnetResult<()> {
        let deadline = deadline_from(timeout);
        self.wait_for_milestone(P2P_READY_MILESTONE, "p2p listener", deadline)
            .await?;
        self.wait_for_milestone(RPC_READY_MILESTONE, "rpc listener", deadline)
            .await?;
        if self.state == NodeState::Launching {
            self.state = NodeState::Reachable;
        }
        self.wait_for_milestone(CHAIN_ADVANCE_MILESTONE, "first block", deadline)
            .await?;
        self.state = NodeState::Live;
        Ok(())
    }

    async fn wait_for_milestone(
        &mut self,
        needle: &str,
        what: &str,
        deadline: Option<Instant>,
    ) -> TestnetResult<()> {
        let started = Instant::now();
        loop {
            if self.log_contains(needle).await {
                debug!("node {} reached milestone: {}", self.name, what);
                return Ok(());
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.state = NodeState::CrashedOnLaunch;
                    return Err(TestnetError::CrashedOnLaunch {
                        name: self.name.clone(),
                        status: status.to_string(),
                    });
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(TestnetError::Timeout {
                        waiting_for: format!("{} of node {}", what, self.name),
                        elapsed: started.elapsed(),
                    });
                }
            }
            sleep(MILESTONE_POLL_INTERVAL).await;
        }
    }

    /// Current head block number, straight from the node's RPC.
    pub async fn head_block_number(&self) -> TestnetResult<u64> {
        let result = self.rpc_client()?.call("get_height", Value::Null).await?;
        result
            .get("height")
            .and_then(Value::as_u64)
            .or_else(|| result.as_u64())
            .ok_or_else(|| anyhow!("unexpected get_height response: {}", result).into())
    }

    /// Daemon version string.
    pub async fn version(&self) -> TestnetResult<String> {
        let result = self.rpc_client()?.call("get_version", Value::Null).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("unexpected get_version response: {}", result).into())
    }

    /// Restrict which peer identities this node accepts connections from.
    /// An empty slice lifts the restriction entirely.
    pub async fn set_allowed_peers(&self, peers: &[String]) -> TestnetResult<()> {
        self.rpc_client()?
            .call("set_allowed_peers", json!({ "peers": peers }))
            .await?;
        Ok(())
    }

    /// Poll the head number until it reaches `target`.
    ///
    /// Progress is logged only when the observed number changes. With
    /// `timeout = None` this waits indefinitely, which is the useful default
    /// while a devnet warms up.
    pub async fn wait_for_block_number(
        &self,
        target: u64,
        timeout: Option<Duration>,
    ) -> TestnetResult<()> {
        let started = Instant::now();
        let deadline = timeout.map(|limit| started + limit);
        let mut last_seen = None;
        loop {
            let head = self.head_block_number().await?;
            if last_seen != Some(head) {
                info!(
                    "node {} is at block {} (waiting for {})",
                    self.name, head, target
                );
                last_seen = Some(head);
            }
            if head >= target {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(TestnetError::Timeout {
                        waiting_for: format!("block {} on node {}", target, self.name),
                        elapsed: started.elapsed(),
                    });
                }
            }
            sleep(BLOCK_POLL_INTERVAL).await;
        }
    }

    /// Wait for `count` more blocks on top of the current head.
    pub async fn wait_for_additional_blocks(
        &self,
        count: u64,
        timeout: Option<Duration>,
    ) -> TestnetResult<()> {
        let current = self.head_block_number().await?;
        self.wait_for_block_number(current + count, timeout).await
    }

    /// Shut the daemon down: SIGINT, a three-second grace period, then
    /// SIGKILL. Idempotent; also runs from the drop guard, so a dropped
    /// `TestNode` can never leave an orphaned daemon behind. Timeouts during
    /// liveness waits deliberately do NOT trigger this - the caller decides
    /// whether a slow node should die.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            shutdown_child(&format!("node {}", self.name), &mut child);
        }
        self.state = NodeState::Closed;
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            shutdown_child(&format!("node {}", self.name), &mut child);
        }
    }
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode")
            .field("name", &self.name)
            .field("directory", &self.directory)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|limit| Instant::now() + limit)
}

/// Poll for a config file the daemon writes on its own, then parse it back
/// so the in-memory view matches what the process will actually use.
async fn wait_for_config_file(path: &Path) -> TestnetResult<NodeConfig> {
    let started = Instant::now();
    while !path.exists() {
        if started.elapsed() >= CONFIG_WAIT_LIMIT {
            return Err(TestnetError::Timeout {
                waiting_for: format!("config file {:?}", path),
                elapsed: started.elapsed(),
            });
        }
        sleep(CONFIG_POLL_INTERVAL).await;
    }
    NodeConfig::load_from_file(path)
}

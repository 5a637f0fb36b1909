//! Companion wallet process bound to one node.
//!
//! A [`WalletClient`] spawns its own `quill_wallet` process, points it at the
//! node's WebSocket endpoint and drives it over the wallet's HTTP RPC. The
//! node handle it is built from is borrowed, never owned: closing the node is
//! the node owner's job and the wallet must never do it.
//!
//! Besides one-shot operations the wallet supports a batching mode: while a
//! batch is open, submitted operations accumulate instead of being broadcast
//! and are signed and pushed as one unit when the batch closes.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use crate::error::{TestnetError, TestnetResult};
use crate::exec::{self, Executable};
use crate::node::{TestNode, DEVNET_CHAIN_ID};
use crate::ports::allocate_port;
use crate::process::shutdown_child;
use crate::rpc::{RpcClient, RpcTransport};

/// Printed once the wallet's HTTP RPC listener is bound.
pub const WALLET_READY_MILESTONE: &str = "Wallet RPC server listening on";

/// Credential every devnet wallet is provisioned with.
pub const DEV_WALLET_PASSWORD: &str = "devnet";

/// The well-known development key, matching the genesis producer account.
pub const DEV_PRIVATE_KEY: &str =
    "9b3c1f6f2e4a5d8c7b0a1e2d3c4b5a69788776655443322110ffeeddccbbaa99";

const WALLET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WALLET_RPC_PROBE_DELAY: Duration = Duration::from_millis(200);

/// Knobs for [`WalletClient::attach`].
#[derive(Debug, Clone)]
pub struct WalletOptions {
    /// Budget for the whole attach sequence; every step draws from it.
    pub timeout: Duration,
    /// Explicit wallet binary, bypassing the discovery chain.
    pub executable: Option<PathBuf>,
    /// Inherit the parent's stdio instead of redirecting to log files.
    pub passthrough_io: bool,
}

impl Default for WalletOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            executable: None,
            passthrough_io: false,
        }
    }
}

/// One wallet-level operation: a method name plus its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub method: String,
    pub params: Value,
}

impl Operation {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Default)]
struct TransactionBatch {
    operations: Vec<Operation>,
}

pub struct WalletClient {
    name: String,
    node_name: String,
    directory: PathBuf,
    child: Option<Child>,
    rpc: RpcClient,
    batch: Option<TransactionBatch>,
}

impl WalletClient {
    /// Spawn a wallet bound to `node` and bring it to a usable state.
    ///
    /// The sequence, each step consuming part of the shared deadline: lease
    /// the wallet's own RPC port, wait for the node's WebSocket listener,
    /// spawn the wallet executable, wait for its ready milestone and RPC
    /// reachability, unlock it with the dev credential and import the dev
    /// key. The borrowed node handle is only read; this client never manages
    /// the node's lifecycle.
    pub async fn attach(node: &TestNode, options: WalletOptions) -> TestnetResult<Self> {
        Self::attach_with_transport(node, options, None).await
    }

    /// Same as [`attach`](Self::attach) with the RPC transport stubbed out.
    /// Meant for tests; the wallet process is still spawned for real.
    pub async fn attach_with_transport(
        node: &TestNode,
        options: WalletOptions,
        transport: Option<Arc<dyn RpcTransport>>,
    ) -> TestnetResult<Self> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let name = format!("{}-wallet", node.name());

        let rpc_port = allocate_port()?;
        let rpc_address = format!("127.0.0.1:{}", rpc_port);

        wait_for_node_ws(node, deadline).await?;
        let ws_address = node
            .config()
            .ws_bind_address
            .as_deref()
            .ok_or_else(|| TestnetError::EndpointUnset {
                name: node.name().to_string(),
                endpoint: "ws",
            })?;

        let path = exec::resolve_executable(Executable::Wallet, options.executable.as_deref())?;
        exec::ensure_devnet_build(&path, Executable::Wallet).await?;

        // The wallet keeps its own directory next to nothing the node uses;
        // log files and wallet state never mix with the node's.
        let directory = node.directory().with_file_name(format!(
            "{}-wallet",
            node.directory()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| node.name().to_string())
        ));
        if directory.exists() {
            fs::remove_dir_all(&directory)?;
        }
        fs::create_dir_all(&directory)?;

        let mut command = Command::new(&path);
        command
            .arg(format!("--chain-id={}", DEVNET_CHAIN_ID))
            .arg("--server")
            .arg(format!("ws://{}", ws_address))
            .arg("--rpc-http")
            .arg(&rpc_address)
            .arg("-d")
            .arg(&directory);
        if options.passthrough_io {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command
                .stdout(Stdio::from(File::create(directory.join("stdout.log"))?))
                .stderr(Stdio::from(File::create(directory.join("stderr.log"))?));
        }
        let child = command.spawn()?;
        info!("launched {} (pid {:?}) from {:?}", name, child.id(), path);

        let endpoint = format!("http://{}/json_rpc", rpc_address);
        let rpc = match transport {
            Some(transport) => RpcClient::with_transport(endpoint, transport),
            None => RpcClient::new(endpoint)?,
        };

        let mut wallet = Self {
            name,
            node_name: node.name().to_string(),
            directory,
            child: Some(child),
            rpc,
            batch: None,
        };

        wallet.wait_until_ready(deadline).await?;
        wallet
            .rpc
            .call("unlock", json!({ "password": DEV_WALLET_PASSWORD }))
            .await?;
        wallet
            .rpc
            .call("import_key", json!({ "key": DEV_PRIVATE_KEY }))
            .await?;
        debug!(
            "{} ready after {:?} (bound to node {})",
            wallet.name,
            started.elapsed(),
            wallet.node_name
        );
        Ok(wallet)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the node this wallet is bound to.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    pub fn stderr_log_path(&self) -> PathBuf {
        self.directory.join("stderr.log")
    }

    async fn wait_until_ready(&mut self, deadline: Instant) -> TestnetResult<()> {
        let started = Instant::now();
        // First the log milestone...
        loop {
            let contents = tokio::fs::read_to_string(self.stderr_log_path())
                .await
                .unwrap_or_default();
            if contents.contains(WALLET_READY_MILESTONE) {
                break;
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(TestnetError::CrashedOnLaunch {
                        name: self.name.clone(),
                        status: status.to_string(),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(TestnetError::Timeout {
                    waiting_for: format!("ready milestone of {}", self.name),
                    elapsed: started.elapsed(),
                });
            }
            sleep(WALLET_POLL_INTERVAL).await;
        }
        // ...then an actual round-trip, since the listener line can precede
        // the handler being wired up. A structured error still proves the
        // server is answering.
        loop {
            match self.rpc.call("is_alive", Value::Null).await {
                Ok(_) | Err(TestnetError::Rpc { .. }) => return Ok(()),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(TestnetError::Timeout {
                    waiting_for: format!("rpc reachability of {}", self.name),
                    elapsed: started.elapsed(),
                });
            }
            sleep(WALLET_RPC_PROBE_DELAY).await;
        }
    }

    /// Raw access to the wallet's RPC surface.
    pub async fn call(&self, method: &str, params: Value) -> TestnetResult<Value> {
        self.rpc.call(method, params).await
    }

    /// Start accumulating operations instead of broadcasting them.
    pub fn open_batch(&mut self) -> TestnetResult<()> {
        if self.batch.is_some() {
            return Err(TestnetError::BatchAlreadyOpen);
        }
        self.batch = Some(TransactionBatch::default());
        Ok(())
    }

    pub fn batch_is_open(&self) -> bool {
        self.batch.is_some()
    }

    /// Operations waiting in the open batch.
    pub fn pending_operations(&self) -> usize {
        self.batch
            .as_ref()
            .map(|batch| batch.operations.len())
            .unwrap_or(0)
    }

    /// Submit one operation.
    ///
    /// Outside a batch the operation is signed and broadcast immediately and
    /// the node's response is returned. Inside a batch it is appended and
    /// nothing is sent until [`close_batch`](Self::close_batch).
    pub async fn submit(&mut self, operation: Operation) -> TestnetResult<Option<Value>> {
        if let Some(batch) = self.batch.as_mut() {
            batch.operations.push(operation);
            return Ok(None);
        }
        let result = self
            .rpc
            .call(
                "sign_and_broadcast",
                json!({ "operations": [operation], "broadcast": true }),
            )
            .await?;
        Ok(Some(result))
    }

    /// Close the open batch, signing all accumulated operations as one unit.
    ///
    /// An empty batch closes without touching the network. With
    /// `broadcast = false` the signed unit is returned but not pushed.
    pub async fn close_batch(&mut self, broadcast: bool) -> TestnetResult<Option<Value>> {
        let batch = self.batch.take().ok_or(TestnetError::BatchNotOpen)?;
        if batch.operations.is_empty() {
            return Ok(None);
        }
        let result = self
            .rpc
            .call(
                "sign_and_broadcast",
                json!({ "operations": batch.operations, "broadcast": broadcast }),
            )
            .await?;
        Ok(Some(result))
    }

    /// Shut the wallet process down with the same SIGINT, grace period,
    /// SIGKILL escalation as a node. Idempotent; also runs on drop. Never
    /// touches the bound node.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            shutdown_child(&self.name, &mut child);
        }
    }
}

impl Drop for WalletClient {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            shutdown_child(&self.name, &mut child);
        }
    }
}

async fn wait_for_node_ws(node: &TestNode, deadline: Instant) -> TestnetResult<()> {
    let started = Instant::now();
    while !node.is_reachable_ws().await {
        if Instant::now() >= deadline {
            return Err(TestnetError::Timeout {
                waiting_for: format!("ws listener of node {}", node.name()),
                elapsed: started.elapsed(),
            });
        }
        sleep(WALLET_POLL_INTERVAL).await;
    }
    Ok(())
}

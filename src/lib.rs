//! # Quill testnet orchestration
//!
//! Harness for standing up local Quill devnets in integration tests. A test
//! declares one or more [`TestNetwork`]s of [`TestNode`]s, launches them
//! (seed wiring and startup ordering are handled here), waits for liveness,
//! then drives the nodes over JSON-RPC - directly through [`RpcClient`] or
//! via a [`WalletClient`] for signed operations. Networks can be partitioned
//! from each other at runtime to reproduce consensus forks, and rejoined.
//!
//! The daemon and wallet executables are found through `QUILL_DAEMON_BIN` /
//! `QUILL_WALLET_BIN` (see [`exec`] for the full discovery chain) and must
//! be devnet builds; mainnet binaries are refused before launch.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use quill_testnet::{CleanupPolicy, TestNetwork};
//!
//! #[tokio::test]
//! async fn three_node_devnet() -> quill_testnet::TestnetResult<()> {
//!     let mut net = TestNetwork::new("alpha", "/tmp/quill-alpha");
//!     net.add_node("producer")?.config_mut().producers.push("init".into());
//!     net.add_node("observer-1")?;
//!     net.add_node("observer-2")?;
//!
//!     net.launch(true).await?;
//!     net.nodes()[2].wait_for_additional_blocks(5, None).await?;
//!     net.teardown(CleanupPolicy::RemoveEverything)
//! }
//! ```
//!
//! Every node process is guarded against leaking: dropping a handle without
//! closing it interrupts the child and escalates to SIGKILL after a grace
//! period.

pub mod config;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod network;
pub mod node;
pub mod ports;
pub mod rpc;
pub mod wallet;

mod process;

pub use config::NodeConfig;
pub use error::{TestnetError, TestnetResult};
pub use monitor::{ResourceMonitor, ResourceSample};
pub use network::{CleanupPolicy, TestNetwork};
pub use node::{LaunchOptions, NodeState, TestNode};
pub use ports::allocate_port;
pub use rpc::{RpcClient, RpcTransport};
pub use wallet::{Operation, WalletClient, WalletOptions};

/// Harness version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

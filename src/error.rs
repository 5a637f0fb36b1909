use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Convenience alias used across the whole harness.
pub type TestnetResult<T> = Result<T, TestnetError>;

/// Every way a testnet run can fail.
///
/// The variants fall into four groups with different handling policies:
/// environment errors (`MissingExecutable`, `UnsupportedBuild`) are fatal and
/// never retried; communication errors are retried inside [`crate::rpc::RpcClient`]
/// before surfacing; `Timeout` leaves the underlying process running and is the
/// caller's problem; the remaining variants are eager domain-invariant checks.
#[derive(Error, Debug)]
pub enum TestnetError {
    #[error("no {role} executable found; set {env_hint} or install {role} in PATH")]
    MissingExecutable {
        role: &'static str,
        env_hint: &'static str,
    },

    #[error("{path:?} is not a devnet build of the {role}: {detail}")]
    UnsupportedBuild {
        role: &'static str,
        path: PathBuf,
        detail: String,
    },

    #[error("no free port between {first} and {last} after {probes} probes")]
    PortExhausted { first: u32, last: u32, probes: u32 },

    #[error(
        "request '{method}' to {endpoint} failed after {attempts} attempts, last response: {last_response:?}"
    )]
    Communication {
        endpoint: String,
        method: String,
        /// The full request body, attached unchanged for diagnosis.
        payload: Value,
        attempts: u32,
        last_response: Option<String>,
    },

    #[error("rpc method '{method}' returned error {code}: {message}")]
    Rpc {
        method: String,
        code: i32,
        message: String,
    },

    #[error("retry budget must allow at least one attempt")]
    EmptyRetryBudget,

    #[error("timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        elapsed: Duration,
    },

    #[error("node {name} exited during startup ({status})")]
    CrashedOnLaunch { name: String, status: String },

    #[error("node {name} has no {endpoint} endpoint configured")]
    EndpointUnset {
        name: String,
        endpoint: &'static str,
    },

    #[error("network {name} has no members")]
    EmptyNetwork { name: String },

    #[error("cannot add members to network {name} after launch")]
    MembersLocked { name: String },

    #[error("networks {a} and {b} are already partitioned")]
    AlreadyPartitioned { a: String, b: String },

    #[error("networks {a} and {b} are not partitioned")]
    NotPartitioned { a: String, b: String },

    #[error("a transaction batch is already open")]
    BatchAlreadyOpen,

    #[error("no transaction batch is open")]
    BatchNotOpen,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

//! Locating the daemon and wallet executables.
//!
//! Resolution order: explicit override, a `--quill-*-bin=` process argument,
//! the dedicated environment variable, a build root (argument or environment)
//! with the usual `target/{release,debug}` layout, and finally PATH. The
//! first existing file wins.

use std::env;
use std::path::{Path, PathBuf};

use log::debug;
use tokio::process::Command;

use crate::error::{TestnetError, TestnetResult};

pub const DAEMON_BIN_ENV: &str = "QUILL_DAEMON_BIN";
pub const WALLET_BIN_ENV: &str = "QUILL_WALLET_BIN";
pub const BUILD_ROOT_ENV: &str = "QUILL_BUILD_ROOT";

const DAEMON_BIN_ARG: &str = "--quill-daemon-bin=";
const WALLET_BIN_ARG: &str = "--quill-wallet-bin=";
const BUILD_ROOT_ARG: &str = "--quill-build-root=";

/// Substring every devnet-capable build prints from `--version`.
/// Mainnet builds lack it and are refused before anything is spawned.
pub const DEVNET_BUILD_MARKER: &str = "devnet-build";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executable {
    Daemon,
    Wallet,
}

impl Executable {
    pub fn file_name(self) -> &'static str {
        match self {
            Executable::Daemon => "quill_daemon",
            Executable::Wallet => "quill_wallet",
        }
    }

    pub fn role(self) -> &'static str {
        match self {
            Executable::Daemon => "daemon",
            Executable::Wallet => "wallet",
        }
    }

    fn bin_env(self) -> &'static str {
        match self {
            Executable::Daemon => DAEMON_BIN_ENV,
            Executable::Wallet => WALLET_BIN_ENV,
        }
    }

    fn bin_arg(self) -> &'static str {
        match self {
            Executable::Daemon => DAEMON_BIN_ARG,
            Executable::Wallet => WALLET_BIN_ARG,
        }
    }
}

fn arg_value(prefix: &str) -> Option<String> {
    env::args().find_map(|arg| arg.strip_prefix(prefix).map(str::to_string))
}

fn build_root() -> Option<PathBuf> {
    arg_value(BUILD_ROOT_ARG)
        .or_else(|| env::var(BUILD_ROOT_ENV).ok())
        .map(PathBuf::from)
}

/// Resolve the path to `which`, trying each source in priority order.
pub fn resolve_executable(which: Executable, explicit: Option<&Path>) -> TestnetResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(path) = arg_value(which.bin_arg()) {
        candidates.push(PathBuf::from(path));
    }
    if let Ok(path) = env::var(which.bin_env()) {
        candidates.push(PathBuf::from(path));
    }
    if let Some(root) = build_root() {
        // Release first: CI builds with --release, local runs usually do not.
        candidates.push(root.join("target/release").join(which.file_name()));
        candidates.push(root.join("target/debug").join(which.file_name()));
    }
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            candidates.push(dir.join(which.file_name()));
        }
    }

    for candidate in candidates {
        if candidate.is_file() {
            debug!("resolved {} executable: {:?}", which.role(), candidate);
            return Ok(candidate);
        }
    }

    Err(TestnetError::MissingExecutable {
        role: which.role(),
        env_hint: which.bin_env(),
    })
}

/// Refuse to drive a mainnet build.
///
/// The executable is invoked once with `--version`; a build compiled for
/// devnet reports the [`DEVNET_BUILD_MARKER`] in its output. Anything else
/// would ignore `--chain-id` and join the real network, so it is rejected
/// outright rather than launched.
pub async fn ensure_devnet_build(path: &Path, which: Executable) -> TestnetResult<()> {
    let output = Command::new(path).arg("--version").output().await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if text.contains(DEVNET_BUILD_MARKER) {
        return Ok(());
    }

    let detail = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no version output")
        .trim()
        .to_string();
    Err(TestnetError::UnsupportedBuild {
        role: which.role(),
        path: path.to_path_buf(),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use parking_lot::Mutex;

    // Tests below mutate process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn fake_executable(dir: &Path, name: &str, version_output: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\necho \"{}\"", version_output).unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn explicit_override_wins() {
        let _guard = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = fake_executable(dir.path(), "quill_daemon", "x");

        let resolved = resolve_executable(Executable::Daemon, Some(&path)).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn env_var_is_consulted() {
        let _guard = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = fake_executable(dir.path(), "quill_wallet", "x");

        env::set_var(WALLET_BIN_ENV, &path);
        let resolved = resolve_executable(Executable::Wallet, None);
        env::remove_var(WALLET_BIN_ENV);

        assert_eq!(resolved.unwrap(), path);
    }

    #[test]
    fn build_root_checks_release_then_debug() {
        let _guard = ENV_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let debug_dir = dir.path().join("target/debug");
        std::fs::create_dir_all(&debug_dir).unwrap();
        let path = fake_executable(&debug_dir, "quill_daemon", "x");

        env::set_var(BUILD_ROOT_ENV, dir.path());
        env::remove_var(DAEMON_BIN_ENV);
        let resolved = resolve_executable(Executable::Daemon, None);
        env::remove_var(BUILD_ROOT_ENV);

        assert_eq!(resolved.unwrap(), path);
    }

    #[test]
    fn missing_everywhere_is_an_error() {
        let _guard = ENV_LOCK.lock();
        env::remove_var(DAEMON_BIN_ENV);
        env::remove_var(BUILD_ROOT_ENV);
        let saved_path = env::var_os("PATH");
        env::set_var("PATH", "");

        let result = resolve_executable(Executable::Daemon, None);

        if let Some(path) = saved_path {
            env::set_var("PATH", path);
        }
        assert!(matches!(
            result,
            Err(TestnetError::MissingExecutable { role: "daemon", .. })
        ));
    }

    #[tokio::test]
    async fn devnet_marker_is_required() {
        let dir = tempfile::tempdir().unwrap();

        let good = fake_executable(dir.path(), "good", "quill_daemon 0.1.0 (devnet-build)");
        ensure_devnet_build(&good, Executable::Daemon).await.unwrap();

        let bad = fake_executable(dir.path(), "bad", "quill_daemon 0.1.0 (mainnet)");
        let err = ensure_devnet_build(&bad, Executable::Daemon)
            .await
            .unwrap_err();
        assert!(matches!(err, TestnetError::UnsupportedBuild { .. }));
    }
}

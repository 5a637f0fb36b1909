//! A named group of nodes wired together as one logical network.
//!
//! Members launch in declaration order with the first member acting as the
//! seed contact for the rest. Two networks can be partitioned from each
//! other at runtime to force their chains apart (the fork-simulation
//! primitive) and rejoined later; the partition bookkeeping on both sides is
//! only ever mutated together, so it can never disagree.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::CONFIG_FILE_NAME;
use crate::error::{TestnetError, TestnetResult};
use crate::node::{LaunchOptions, TestNode};

/// What `teardown` leaves on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Remove the whole network directory.
    #[default]
    RemoveEverything,
    /// Remove logs and chain state but keep each node's config file, so the
    /// run can be reproduced by hand.
    RemoveDisposableFiles,
    /// Keep everything for post-mortem inspection.
    DoNotRemoveFiles,
}

pub struct TestNetwork {
    name: String,
    directory: PathBuf,
    nodes: Vec<TestNode>,
    running: bool,
    disconnected_from: HashSet<String>,
}

impl TestNetwork {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            nodes: Vec::new(),
            running: false,
            disconnected_from: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&TestNode> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut TestNode> {
        self.nodes.iter_mut().find(|node| node.name() == name)
    }

    /// Whether this network currently records a partition against `other`.
    pub fn partitioned_from(&self, other: &str) -> bool {
        self.disconnected_from.contains(other)
    }

    /// Create a member node under this network's directory.
    ///
    /// Members can only be added before launch; insertion order is the
    /// startup and seed-wiring order.
    pub fn add_node(&mut self, name: &str) -> TestnetResult<&mut TestNode> {
        if self.running {
            return Err(TestnetError::MembersLocked {
                name: self.name.clone(),
            });
        }
        let node = TestNode::new(name, self.directory.join(name));
        let index = self.nodes.len();
        self.nodes.push(node);
        Ok(&mut self.nodes[index])
    }

    /// Adopt an externally constructed node as a member.
    pub fn add_member(&mut self, node: TestNode) -> TestnetResult<()> {
        if self.running {
            return Err(TestnetError::MembersLocked {
                name: self.name.clone(),
            });
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Record member 0 as the seed contact of every other member.
    ///
    /// Called by [`launch`](Self::launch); public so wiring can be inspected
    /// without spawning anything.
    pub fn wire_seed_nodes(&mut self) -> TestnetResult<()> {
        if self.nodes.len() < 2 {
            return Ok(());
        }
        let (seed, rest) = self.nodes.split_at_mut(1);
        for node in rest {
            node.add_seed_node(&mut seed[0])?;
        }
        Ok(())
    }

    /// Bring the whole network up.
    ///
    /// Seed wiring first, then a clean network directory, then members start
    /// strictly in order: each must report its P2P listener bound before the
    /// next is spawned, so nobody dials a seed that is not accepting yet.
    pub async fn launch(&mut self, wait_for_live: bool) -> TestnetResult<()> {
        if self.nodes.is_empty() {
            return Err(TestnetError::EmptyNetwork {
                name: self.name.clone(),
            });
        }

        self.wire_seed_nodes()?;

        if self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
        }
        fs::create_dir_all(&self.directory)?;

        info!("launching network {} ({} nodes)", self.name, self.nodes.len());
        for node in self.nodes.iter_mut() {
            node.launch(LaunchOptions {
                wait_for_live: false,
                ..Default::default()
            })
            .await?;
            node.wait_until_p2p_reachable(None).await?;
            debug!("network {}: node {} accepting peers", self.name, node.name());
        }
        self.running = true;

        if wait_for_live {
            for node in self.nodes.iter_mut() {
                node.wait_until_live(None).await?;
            }
        }
        Ok(())
    }

    /// Connect this network with `other`.
    ///
    /// Before launch this is plain wiring: the first producing member of
    /// `other` (or its first member) becomes a seed of every member here.
    /// After launch it is the rejoin half of a partition cycle: both sides
    /// must currently record each other as disconnected, every member of
    /// both networks goes back to accepting anyone, and the records are
    /// cleared together.
    pub async fn connect_with(&mut self, other: &mut TestNetwork) -> TestnetResult<()> {
        self.ensure_members(other)?;

        if self.partitioned_from(other.name()) && other.partitioned_from(self.name()) {
            for node in &self.nodes {
                node.set_allowed_peers(&[]).await?;
            }
            for node in &other.nodes {
                node.set_allowed_peers(&[]).await?;
            }
            self.disconnected_from.remove(other.name());
            other.disconnected_from.remove(self.name());
            info!("networks {} and {} rejoined", self.name, other.name);
            return Ok(());
        }

        if !self.running {
            let seed_index = other
                .nodes
                .iter()
                .position(|node| node.config().produces())
                .unwrap_or(0);
            let seed = &mut other.nodes[seed_index];
            for node in &mut self.nodes {
                node.add_seed_node(seed)?;
            }
            return Ok(());
        }

        // Running networks that were never formally disconnected: only one
        // outstanding partition per pair is supported, and rejoining a pair
        // that never split is a test bug worth failing loudly on.
        Err(TestnetError::NotPartitioned {
            a: self.name.clone(),
            b: other.name.clone(),
        })
    }

    /// Partition this network from `other`.
    ///
    /// Records the split on both sides, then restricts every member of each
    /// network to its own topology-mates. From that point the two groups
    /// refuse each other's peer connections and their chains are free to
    /// diverge.
    pub async fn disconnect_from(&mut self, other: &mut TestNetwork) -> TestnetResult<()> {
        self.ensure_members(other)?;

        if self.partitioned_from(other.name()) || other.partitioned_from(self.name()) {
            return Err(TestnetError::AlreadyPartitioned {
                a: self.name.clone(),
                b: other.name.clone(),
            });
        }

        self.disconnected_from.insert(other.name().to_string());
        other.disconnected_from.insert(self.name().to_string());

        self.restrict_to_own_members().await?;
        other.restrict_to_own_members().await?;
        info!("networks {} and {} partitioned", self.name, other.name);
        Ok(())
    }

    fn ensure_members(&self, other: &TestNetwork) -> TestnetResult<()> {
        if self.nodes.is_empty() {
            return Err(TestnetError::EmptyNetwork {
                name: self.name.clone(),
            });
        }
        if other.nodes.is_empty() {
            return Err(TestnetError::EmptyNetwork {
                name: other.name.clone(),
            });
        }
        Ok(())
    }

    async fn restrict_to_own_members(&self) -> TestnetResult<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            let mates: Vec<String> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(mate, _)| *mate != index)
                .filter_map(|(_, mate)| mate.peer_address())
                .collect();
            // A single-member network sends an empty list, which the daemon
            // reads as accept-anyone; with no topology-mates there is nobody
            // to restrict to, so the call is a deliberate no-op.
            node.set_allowed_peers(&mates).await?;
        }
        Ok(())
    }

    /// Close every member in order, then apply the cleanup policy.
    pub fn teardown(&mut self, policy: CleanupPolicy) -> TestnetResult<()> {
        info!("tearing down network {}", self.name);
        for node in self.nodes.iter_mut() {
            node.close();
        }
        self.running = false;

        match policy {
            CleanupPolicy::RemoveEverything => {
                if self.directory.exists() {
                    fs::remove_dir_all(&self.directory)?;
                }
            }
            CleanupPolicy::RemoveDisposableFiles => {
                for node in &self.nodes {
                    remove_disposable_files(node.directory())?;
                }
            }
            CleanupPolicy::DoNotRemoveFiles => {}
        }
        Ok(())
    }
}

/// Delete everything in a node directory except its config file.
fn remove_disposable_files(directory: &Path) -> TestnetResult<()> {
    if !directory.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_name() == CONFIG_FILE_NAME {
            continue;
        }
        let path = entry.path();
        let removed = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = removed {
            warn!("failed to remove {:?}: {}", path, err);
        }
    }
    Ok(())
}

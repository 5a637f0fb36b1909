//! Resource usage sampling for spawned daemons.
//!
//! Long partition scenarios can run dozens of nodes for minutes; when one of
//! them starts swapping, the test failure that follows looks like a
//! consensus bug. Sampling RSS and CPU per node and publishing both through
//! the `metrics` facade makes that failure mode visible in whatever exporter
//! the embedding test suite has installed.

use log::trace;
use metrics::gauge;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::node::TestNode;

/// One observation of a node process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    /// CPU usage in percent of one core since the previous sample.
    pub cpu_percent: f32,
}

/// Samples node processes through `sysinfo`.
///
/// Keep one monitor alive across samples: CPU percentages are computed as a
/// delta against the previous refresh, so the first sample of a process
/// always reports zero CPU.
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample `node`, publishing gauges labelled with the node name.
    /// Returns `None` when the node has no running process.
    pub fn sample(&mut self, node: &TestNode) -> Option<ResourceSample> {
        let pid = Pid::from_u32(node.pid()?);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;

        let sample = ResourceSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        };
        trace!(
            "node {}: rss {} bytes, cpu {:.1}%",
            node.name(),
            sample.memory_bytes,
            sample.cpu_percent
        );
        gauge!("testnet_node_memory_bytes", "node" => node.name().to_string())
            .set(sample.memory_bytes as f64);
        gauge!("testnet_node_cpu_percent", "node" => node.name().to_string())
            .set(sample.cpu_percent as f64);
        Some(sample)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_a_stopped_node_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let node = TestNode::new("alpha", dir.path().join("alpha"));
        let mut monitor = ResourceMonitor::new();
        assert!(monitor.sample(&node).is_none());
    }

    #[test]
    fn the_monitor_can_sample_a_real_process() {
        // Sample our own pid through the same sysinfo plumbing the node path
        // uses; the harness process certainly has a nonzero RSS.
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = system.process(pid).expect("own process visible");
        assert!(process.memory() > 0);
    }
}

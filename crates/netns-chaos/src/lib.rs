//! Network-namespace chaos testbench for a gossip node.
//!
//! This crate provisions isolated virtual network topologies (namespaces,
//! veth pairs, bridges), launches node-under-test instances in
//! publisher/subscriber/relay roles inside them, and drives a seeded,
//! deterministic timeline of network impairments and process-level faults
//! while recording a schedule log, a combined execution log, and optional
//! resource metrics.
//!
//! Coordination with the spawned roles happens only through filesystem
//! readiness artifacts (bounded polling) and OS signals; there is no
//! in-process IPC. The OS namespace table and per-link impairment state are
//! host-global, so run at most one scenario per host at a time.

pub mod config;
pub mod faults;
pub mod netns;
pub mod process;
pub mod qdisc;
pub mod recorder;
pub mod scenario;
pub mod topology;
pub mod veth;

pub use config::ChaosConfig;
pub use faults::FaultInjector;
pub use process::{Role, RoleProcess, RoleSpec, Transport};
pub use recorder::RunRecorder;
pub use scenario::{run_scenario, ScenarioOutcome};
pub use topology::{teardown_shape, LinkEndpoint, Topology, TopologyManager, TopologyShape};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("Network namespace error: {0}")]
    NetNs(#[from] netns::NetNsError),

    #[error("Virtual link error: {0}")]
    Veth(#[from] veth::VethError),

    #[error("Qdisc configuration error: {0}")]
    Qdisc(#[from] qdisc::QdiscError),

    #[error("Role '{role}' did not become ready within {attempts} x {interval_ms}ms")]
    ReadinessTimeout {
        role: String,
        attempts: u32,
        interval_ms: u64,
    },

    #[error("Process failure: {0}")]
    Process(String),

    #[error("Run recording error: {0}")]
    Record(#[from] std::io::Error),

    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

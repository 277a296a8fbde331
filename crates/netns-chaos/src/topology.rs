//! Topology provisioning and teardown.
//!
//! Each shape maps to a fixed set of namespaces, devices, and /24 addresses
//! so runs are reproducible. The fixed global names mean two scenarios of
//! the same shape cannot share a host; run one scenario per host at a time.
//!
//! Teardown is best-effort and idempotent: it walks everything the shape
//! *could* have created, swallows "already gone" at every step, and is safe
//! to invoke after partial provisioning or twice in a row.

use crate::netns::NetNsManager;
use crate::qdisc::{QdiscError, QdiscManager};
use crate::veth::{host_address, LinkManager};
use crate::ChaosError;
use fault_profiles::ImpairmentSpec;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::{info, warn};

/// Prefix shared by every namespace this crate creates; used for stale
/// sweeps before provisioning.
pub const NS_PREFIX: &str = "chaos-";

/// Bridge device used by the multi-party shapes.
const BRIDGE: &str = "chaos-br0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyShape {
    /// Publisher and subscriber directly linked.
    Pair,
    /// Publisher, relay, subscriber on a shared bridge (3-hop relay path).
    Line,
    /// Hub plus three leaves on a shared bridge (fan-out through one relay).
    Star,
    /// Pair wiring, exercised with bandwidth-shaping profiles.
    Throttle,
}

impl TopologyShape {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyShape::Pair => "pair",
            TopologyShape::Line => "line",
            TopologyShape::Star => "star",
            TopologyShape::Throttle => "throttle",
        }
    }

    /// Member slots in this shape, with their fixed host octet.
    pub fn members(&self) -> &'static [(&'static str, u8)] {
        match self {
            TopologyShape::Pair | TopologyShape::Throttle => &[("pub", 1), ("sub", 2)],
            TopologyShape::Line => &[("pub", 1), ("relay", 2), ("sub", 3)],
            TopologyShape::Star => &[("hub", 1), ("leaf1", 2), ("leaf2", 3), ("leaf3", 4)],
        }
    }

    /// Fixed /24 subnet for this shape.
    pub fn subnet(&self) -> Ipv4Addr {
        match self {
            TopologyShape::Pair => Ipv4Addr::new(10, 231, 1, 0),
            TopologyShape::Line => Ipv4Addr::new(10, 231, 2, 0),
            TopologyShape::Star => Ipv4Addr::new(10, 231, 3, 0),
            TopologyShape::Throttle => Ipv4Addr::new(10, 231, 4, 0),
        }
    }

    /// Multi-party shapes hang every member off a shared bridge; pair
    /// shapes wire the two namespaces directly.
    pub fn bridged(&self) -> bool {
        matches!(self, TopologyShape::Line | TopologyShape::Star)
    }

    pub fn namespace(&self, member: &str) -> String {
        format!("{NS_PREFIX}{member}")
    }

    pub fn device(&self, member: &str) -> String {
        format!("veth-{member}")
    }

    fn bridge_leg(&self, member: &str) -> String {
        format!("br-{member}")
    }
}

impl fmt::Display for TopologyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TopologyShape {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pair" => Ok(TopologyShape::Pair),
            "line" => Ok(TopologyShape::Line),
            "star" => Ok(TopologyShape::Star),
            "throttle" => Ok(TopologyShape::Throttle),
            _ => Err(anyhow::anyhow!(
                "unknown topology: {s} (expected pair|line|star|throttle)"
            )),
        }
    }
}

/// One member's attachment point: the namespace-local device that qdiscs
/// are applied to, and the address the role binds.
#[derive(Clone, Debug)]
pub struct LinkEndpoint {
    pub member: String,
    pub namespace: String,
    pub device: String,
    pub ip: Ipv4Addr,
}

/// A provisioned topology: live namespaces and links for one shape.
#[derive(Debug)]
pub struct Topology {
    pub shape: TopologyShape,
    endpoints: Vec<LinkEndpoint>,
}

impl Topology {
    pub fn endpoints(&self) -> &[LinkEndpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, member: &str) -> Result<&LinkEndpoint, ChaosError> {
        self.endpoints
            .iter()
            .find(|e| e.member == member)
            .ok_or_else(|| {
                ChaosError::InvalidConfig(format!("no member '{member}' in {}", self.shape))
            })
    }
}

/// Provisions and destroys topologies.
pub struct TopologyManager {
    netns: NetNsManager,
    links: LinkManager,
    qdisc: QdiscManager,
}

impl TopologyManager {
    /// Create a manager and sweep namespaces left behind by crashed runs.
    pub async fn new() -> Result<Self, ChaosError> {
        let mut netns = NetNsManager::new()?;
        let swept = netns.sweep_stale(NS_PREFIX).await;
        if swept > 0 {
            info!("swept {} stale namespaces from a previous run", swept);
        }
        let links = LinkManager::new().await?;
        Ok(Self {
            netns,
            links,
            qdisc: QdiscManager::new(),
        })
    }

    /// Create every namespace and link the shape requires. On failure the
    /// caller must still invoke [`TopologyManager::teardown`]; provisioning
    /// does not clean up after itself.
    pub async fn provision(&mut self, shape: TopologyShape) -> Result<Topology, ChaosError> {
        info!("provisioning {} topology", shape);
        let subnet = shape.subnet();
        let mut endpoints = Vec::new();

        if shape.bridged() {
            self.links.ensure_bridge(BRIDGE).await?;
        }

        for (member, octet) in shape.members() {
            let ns = shape.namespace(member);
            let device = shape.device(member);
            self.netns.create(&ns).await?;
            self.links.set_loopback_up(&ns, &self.netns).await?;

            if shape.bridged() {
                let leg = shape.bridge_leg(member);
                let _ = self.links.delete_if_exists(&device).await;
                let _ = self.links.delete_if_exists(&leg).await;
                self.links.create_pair(&device, &leg).await?;
                self.links
                    .move_to_namespace(&device, &ns, &self.netns)
                    .await?;
                self.links.attach_to_bridge(&leg, BRIDGE).await?;
            }

            let address = host_address(subnet, *octet)?;
            endpoints.push(LinkEndpoint {
                member: member.to_string(),
                namespace: ns,
                device,
                ip: address.ip(),
            });
        }

        if !shape.bridged() {
            // Direct wiring: one veth pair, each end moved into its
            // namespace, keeping its root-namespace name.
            let (a, _) = shape.members()[0];
            let (b, _) = shape.members()[1];
            let dev_a = shape.device(a);
            let dev_b = shape.device(b);
            let _ = self.links.delete_if_exists(&dev_a).await;
            let _ = self.links.delete_if_exists(&dev_b).await;
            self.links.create_pair(&dev_a, &dev_b).await?;
            self.links
                .move_to_namespace(&dev_a, &shape.namespace(a), &self.netns)
                .await?;
            self.links
                .move_to_namespace(&dev_b, &shape.namespace(b), &self.netns)
                .await?;
        }

        // Address and bring up every namespace-side device.
        for (member, octet) in shape.members() {
            let ns = shape.namespace(member);
            let device = shape.device(member);
            self.links
                .add_address(&device, host_address(subnet, *octet)?, &ns, &self.netns)
                .await?;
            self.links
                .set_up(&device, Some((&ns, &self.netns)))
                .await?;
        }

        info!("{} topology up ({} members)", shape, endpoints.len());
        Ok(Topology { shape, endpoints })
    }

    /// Atomically replace the impairment state on one endpoint.
    pub async fn apply_impairment(
        &self,
        endpoint: &LinkEndpoint,
        spec: &ImpairmentSpec,
    ) -> Result<(), QdiscError> {
        self.qdisc
            .apply(
                &endpoint.namespace,
                &endpoint.device,
                spec,
                self.netns.base_dir(),
            )
            .await
    }

    /// Remove everything the shape could have created. Every step is
    /// best-effort; errors are logged and swallowed so cleanup can never
    /// mask the run's real result.
    pub async fn teardown(&mut self, shape: TopologyShape) {
        info!("tearing down {} topology", shape);

        for (member, _) in shape.members() {
            let ns = shape.namespace(member);
            let device = shape.device(member);

            // Release qdisc references before the namespace goes away.
            self.qdisc
                .clear(&ns, &device, self.netns.base_dir())
                .await;

            // Devices still sitting in the root namespace (partial
            // provisioning) would otherwise leak.
            if let Err(e) = self.links.delete_if_exists(&device).await {
                warn!("teardown: could not delete {}: {}", device, e);
            }
            if shape.bridged() {
                let leg = shape.bridge_leg(member);
                if let Err(e) = self.links.delete_if_exists(&leg).await {
                    warn!("teardown: could not delete {}: {}", leg, e);
                }
            }

            if let Err(e) = self.netns.remove(&ns).await {
                warn!("teardown: could not remove namespace {}: {}", ns, e);
            }
        }

        if shape.bridged() {
            if let Err(e) = self.links.delete_if_exists(BRIDGE).await {
                warn!("teardown: could not delete bridge {}: {}", BRIDGE, e);
            }
        }
    }

    /// Base directory of the namespace bind mounts, for `ip netns exec`
    /// invocations made outside this module (process spawning).
    pub fn netns_base_dir(&self) -> &std::path::Path {
        self.netns.base_dir()
    }
}

/// Tear down a shape without a live [`Topology`], for cleaning up after a
/// crashed or interrupted run.
pub async fn teardown_shape(shape: TopologyShape) -> Result<(), ChaosError> {
    let mut manager = TopologyManager::new().await?;
    manager.teardown(shape).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_have_fixed_membership() {
        assert_eq!(TopologyShape::Pair.members().len(), 2);
        assert_eq!(TopologyShape::Line.members().len(), 3);
        assert_eq!(TopologyShape::Star.members().len(), 4);
        assert_eq!(TopologyShape::Throttle.members().len(), 2);
    }

    #[test]
    fn subnets_do_not_overlap_across_shapes() {
        let shapes = [
            TopologyShape::Pair,
            TopologyShape::Line,
            TopologyShape::Star,
            TopologyShape::Throttle,
        ];
        for (i, a) in shapes.iter().enumerate() {
            for b in &shapes[i + 1..] {
                assert_ne!(a.subnet(), b.subnet(), "{a} and {b} collide");
            }
        }
    }

    #[test]
    fn member_names_resolve_to_stable_identifiers() {
        let shape = TopologyShape::Line;
        assert_eq!(shape.namespace("relay"), "chaos-relay");
        assert_eq!(shape.device("relay"), "veth-relay");
        for (member, _) in shape.members() {
            assert!(crate::veth::is_valid_interface_name(&shape.device(member)));
            assert!(crate::veth::is_valid_interface_name(&shape.bridge_leg(member)));
        }
    }

    #[test]
    fn shape_names_round_trip() {
        for shape in [
            TopologyShape::Pair,
            TopologyShape::Line,
            TopologyShape::Star,
            TopologyShape::Throttle,
        ] {
            let parsed: TopologyShape = shape.name().parse().unwrap();
            assert_eq!(parsed, shape);
        }
        assert!("ring".parse::<TopologyShape>().is_err());
    }

    #[test]
    fn star_addressing_is_deterministic() {
        let shape = TopologyShape::Star;
        let subnet = shape.subnet();
        let hub = host_address(subnet, shape.members()[0].1).unwrap();
        assert_eq!(hub.ip(), Ipv4Addr::new(10, 231, 3, 1));
        let leaf3 = host_address(subnet, shape.members()[3].1).unwrap();
        assert_eq!(leaf3.ip(), Ipv4Addr::new(10, 231, 3, 4));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(feature = "sudo-tests")]
    async fn pair_provision_teardown_is_idempotent() {
        let mut manager = TopologyManager::new().await.unwrap();
        let topo = manager.provision(TopologyShape::Pair).await.unwrap();
        assert_eq!(topo.endpoints().len(), 2);
        manager.teardown(TopologyShape::Pair).await;
        // Second teardown must be a no-op, not an error.
        manager.teardown(TopologyShape::Pair).await;
    }
}

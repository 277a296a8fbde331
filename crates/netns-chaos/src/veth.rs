//! Virtual link plumbing: veth pairs, bridges, and addressing.
//!
//! Point-to-point topologies get a single veth pair with one end moved into
//! each namespace. Bridged topologies keep one leg of each pair in the root
//! namespace, enslaved to a Linux bridge. Bridge enslavement goes through
//! `ip link` (same pragmatic route the qdisc module takes for `tc`); all
//! other link operations use rtnetlink directly.

use crate::netns::{NetNsError, NetNsManager};
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use rtnetlink::{new_connection, Handle};
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum VethError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Interface '{0}' not found")]
    NotFound(String),

    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    #[error("Failed to create veth pair: {0}")]
    CreateFailed(rtnetlink::Error),

    #[error("Failed to move interface to namespace: {0}")]
    MoveFailed(rtnetlink::Error),

    #[error("Failed to bring interface up: {0}")]
    SetUpFailed(rtnetlink::Error),

    #[error("Failed to assign address: {0}")]
    AddrFailed(rtnetlink::Error),

    #[error("Bridge operation failed: {0}")]
    Bridge(String),

    #[error("Netlink query failed: {0}")]
    Query(rtnetlink::Error),

    #[error("Namespace error: {0}")]
    NetNs(#[from] NetNsError),
}

/// Owns the root-namespace netlink handle and performs all link-level
/// configuration for a topology.
pub struct LinkManager {
    handle: Handle,
}

impl LinkManager {
    pub async fn new() -> Result<Self, VethError> {
        let (connection, handle, _) = new_connection().map_err(VethError::Io)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Create a veth pair in the root namespace.
    pub async fn create_pair(&self, left: &str, right: &str) -> Result<(), VethError> {
        for name in [left, right] {
            if !is_valid_interface_name(name) {
                return Err(VethError::InvalidName(name.to_string()));
            }
        }

        debug!("creating veth pair: {} <-> {}", left, right);
        self.handle
            .link()
            .add()
            .veth(left.to_string(), right.to_string())
            .execute()
            .await
            .map_err(VethError::CreateFailed)?;

        // The kernel needs a beat before the new links are queryable.
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        info!("created veth pair: {} <-> {}", left, right);
        Ok(())
    }

    /// Move an interface from the root namespace into `ns`.
    pub async fn move_to_namespace(
        &self,
        iface: &str,
        ns: &str,
        netns: &NetNsManager,
    ) -> Result<(), VethError> {
        let index = self.index_of(&self.handle, iface).await?;
        let fd = netns.fd(ns)?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(fd)
            .execute()
            .await
            .map_err(VethError::MoveFailed)?;
        debug!("moved {} into {}", iface, ns);
        Ok(())
    }

    /// Bring an interface up, in the root namespace or inside `ns`.
    pub async fn set_up(
        &self,
        iface: &str,
        ns: Option<(&str, &NetNsManager)>,
    ) -> Result<(), VethError> {
        let handle = self.handle_for(ns)?;
        let index = self.index_of(&handle, iface).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(VethError::SetUpFailed)?;
        debug!("interface {} up (ns: {:?})", iface, ns.map(|(n, _)| n));
        Ok(())
    }

    /// Assign an IPv4 address inside `ns`. An address that is already
    /// present is fine; provisioning retries after partial failures.
    pub async fn add_address(
        &self,
        iface: &str,
        network: Ipv4Network,
        ns: &str,
        netns: &NetNsManager,
    ) -> Result<(), VethError> {
        let handle = netns.netlink_handle(ns)?;
        let index = self.index_of(&handle, iface).await?;
        match handle
            .address()
            .add(index, std::net::IpAddr::V4(network.ip()), network.prefix())
            .execute()
            .await
        {
            Ok(()) => {
                info!("assigned {} to {} in {}", network, iface, ns);
                Ok(())
            }
            Err(e) if e.to_string().contains("File exists") => {
                debug!("address {} already present on {} in {}", network, iface, ns);
                Ok(())
            }
            Err(e) => Err(VethError::AddrFailed(e)),
        }
    }

    /// Bring the loopback interface up inside `ns`.
    pub async fn set_loopback_up(&self, ns: &str, netns: &NetNsManager) -> Result<(), VethError> {
        let handle = netns.netlink_handle(ns)?;
        let index = self.index_of(&handle, "lo").await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(VethError::SetUpFailed)
    }

    /// Delete an interface from the root namespace if it exists. Interfaces
    /// that have already been moved into a namespace (and died with it) are
    /// silently absent.
    pub async fn delete_if_exists(&self, iface: &str) -> Result<(), VethError> {
        match self.index_of(&self.handle, iface).await {
            Ok(index) => {
                self.handle
                    .link()
                    .del(index)
                    .execute()
                    .await
                    .map_err(VethError::CreateFailed)?;
                info!("deleted interface: {}", iface);
                Ok(())
            }
            Err(VethError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Create a bridge in the root namespace (or reuse a leftover one) and
    /// bring it up.
    pub async fn ensure_bridge(&self, name: &str) -> Result<(), VethError> {
        if !is_valid_interface_name(name) {
            return Err(VethError::InvalidName(name.to_string()));
        }
        let status = Command::new("ip")
            .args(["link", "add", "name", name, "type", "bridge"])
            .output()
            .await
            .map_err(VethError::Io)?;
        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr);
            if !stderr.contains("File exists") {
                return Err(VethError::Bridge(format!(
                    "ip link add {} type bridge: {}",
                    name, stderr
                )));
            }
            warn!("reusing leftover bridge {}", name);
        }
        self.set_up(name, None).await?;
        info!("bridge {} ready", name);
        Ok(())
    }

    /// Enslave a root-namespace interface to a bridge and bring it up.
    pub async fn attach_to_bridge(&self, iface: &str, bridge: &str) -> Result<(), VethError> {
        let output = Command::new("ip")
            .args(["link", "set", iface, "master", bridge])
            .output()
            .await
            .map_err(VethError::Io)?;
        if !output.status.success() {
            return Err(VethError::Bridge(format!(
                "ip link set {} master {}: {}",
                iface,
                bridge,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        self.set_up(iface, None).await?;
        debug!("attached {} to bridge {}", iface, bridge);
        Ok(())
    }

    fn handle_for(&self, ns: Option<(&str, &NetNsManager)>) -> Result<Handle, VethError> {
        match ns {
            Some((name, netns)) => Ok(netns.netlink_handle(name)?),
            None => Ok(self.handle.clone()),
        }
    }

    async fn index_of(&self, handle: &Handle, name: &str) -> Result<u32, VethError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(VethError::NotFound(name.to_string())),
            // rtnetlink surfaces a missing match_name as an error on some
            // kernels; treat both shapes as "not found".
            Err(_) => Err(VethError::NotFound(name.to_string())),
        }
    }
}

/// Helper for composing host-side /24 addresses.
pub fn host_address(subnet: Ipv4Addr, host: u8) -> Result<Ipv4Network, VethError> {
    let octets = subnet.octets();
    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], host);
    Ipv4Network::new(ip, 24).map_err(|e| VethError::Bridge(e.to_string()))
}

/// Validate an interface name according to Linux rules.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_validation() {
        assert!(is_valid_interface_name("veth-pub"));
        assert!(is_valid_interface_name("chaos-br0"));
        assert!(is_valid_interface_name("br-leaf1"));

        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("this-name-is-way-too-long"));
        assert!(!is_valid_interface_name("-leading-dash"));
        assert!(!is_valid_interface_name("bad@name"));
    }

    #[test]
    fn host_addresses_share_the_subnet() {
        let subnet = Ipv4Addr::new(10, 231, 1, 0);
        let a = host_address(subnet, 1).unwrap();
        let b = host_address(subnet, 2).unwrap();
        assert_eq!(a.ip(), Ipv4Addr::new(10, 231, 1, 1));
        assert_eq!(b.ip(), Ipv4Addr::new(10, 231, 1, 2));
        assert_eq!(a.prefix(), 24);
        assert!(a.contains(b.ip()));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(feature = "sudo-tests")]
    async fn veth_create_and_delete() {
        let manager = LinkManager::new().await.unwrap();
        manager.create_pair("chaos-t-a", "chaos-t-b").await.unwrap();
        manager.delete_if_exists("chaos-t-a").await.unwrap();
        // Deleting one end removes both; second delete is a no-op.
        manager.delete_if_exists("chaos-t-b").await.unwrap();
    }
}

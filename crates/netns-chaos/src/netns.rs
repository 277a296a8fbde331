//! Network namespace lifecycle.
//!
//! Namespaces are created with the `/var/run/netns/<name>` bind-mount
//! convention so `ip netns exec` interoperates with them. Deletion is
//! tolerant: removing a namespace that is already gone succeeds, and busy
//! mounts are detached lazily, because teardown must never fail a run.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use rtnetlink::{new_connection, Handle};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Failed to prepare netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("Failed to bind-mount namespace: {0}")]
    Mount(nix::Error),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("Namespace '{0}' not tracked")]
    NotFound(String),

    #[error("Netlink connection failed in namespace: {0}")]
    Connection(std::io::Error),

    #[error("Insufficient permissions (CAP_NET_ADMIN required)")]
    Permission,
}

/// Tracks the namespaces this run created and owns their open fds.
pub struct NetNsManager {
    namespaces: HashMap<String, File>,
    base_dir: PathBuf,
}

impl NetNsManager {
    pub fn new() -> Result<Self, NetNsError> {
        let base_dir = PathBuf::from("/var/run/netns");
        std::fs::create_dir_all(&base_dir).map_err(NetNsError::CreateDir)?;
        Ok(Self {
            namespaces: HashMap::new(),
            base_dir,
        })
    }

    /// Directory holding the namespace bind mounts; exported so `ip` and
    /// `tc` invocations can be pinned to it via `IP_NETNS_DIR`.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a namespace, replacing any stale file left by a previous run.
    pub async fn create(&mut self, name: &str) -> Result<(), NetNsError> {
        let ns_path = self.base_dir.join(name);
        if ns_path.exists() {
            warn!("replacing stale namespace file: {}", name);
            self.remove(name).await?;
        }

        debug!("creating namespace: {}", name);
        tokio::fs::File::create(&ns_path)
            .await
            .map_err(NetNsError::CreateFile)?;

        // Unshare on a blocking thread so the calling task's namespace is
        // untouched, then bind-mount the new netns onto the prepared file.
        // `/proc/thread-self/ns/net` names the unshared thread's namespace;
        // the pid-level `ns/net` is the main thread's and would alias the
        // root namespace. The thread is pooled, so its original namespace
        // is restored before it is handed back.
        let created = tokio::task::spawn_blocking({
            let ns_path = ns_path.clone();
            move || -> Result<(), NetNsError> {
                let original = OpenOptions::new()
                    .read(true)
                    .open("/proc/thread-self/ns/net")
                    .map_err(NetNsError::OpenNs)?;
                unshare(CloneFlags::CLONE_NEWNET).map_err(|_| NetNsError::Permission)?;
                let mounted = mount(
                    Some("/proc/thread-self/ns/net"),
                    &ns_path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(NetNsError::Mount);
                setns(&original, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
                mounted
            }
        })
        .await
        .map_err(|e| NetNsError::CreateFile(std::io::Error::other(e)))?;

        if let Err(e) = created {
            let _ = tokio::fs::remove_file(&ns_path).await;
            return Err(e);
        }

        let file = OpenOptions::new()
            .read(true)
            .open(&ns_path)
            .map_err(NetNsError::OpenNs)?;
        self.namespaces.insert(name.to_string(), file);
        info!("created namespace: {}", name);
        Ok(())
    }

    /// Remove a namespace. Absent namespaces are not an error, and unmount
    /// failures fall back to `ip netns del` before giving up.
    pub async fn remove(&mut self, name: &str) -> Result<(), NetNsError> {
        self.namespaces.remove(name);

        let ns_path = self.base_dir.join(name);
        if !ns_path.exists() {
            return Ok(());
        }

        for attempt in 1..=3 {
            match umount2(&ns_path, MntFlags::MNT_DETACH) {
                Ok(()) => break,
                Err(e) if attempt < 3 => {
                    debug!("unmount attempt {} for {} failed: {}, retrying", attempt, name, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
                Err(e) => warn!("could not unmount namespace {}: {}", name, e),
            }
        }

        if let Err(e) = tokio::fs::remove_file(&ns_path).await {
            let _ = tokio::process::Command::new("ip")
                .args(["netns", "del", name])
                .status()
                .await;
            if ns_path.exists() {
                return Err(NetNsError::CreateFile(e));
            }
        }

        info!("removed namespace: {}", name);
        Ok(())
    }

    /// Remove every namespace file matching `prefix`, returning how many
    /// were cleaned. Used to sweep leftovers from crashed runs before
    /// provisioning.
    pub async fn sweep_stale(&mut self, prefix: &str) -> usize {
        let mut cleaned = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(name) = entry.file_name().into_string() {
                    if name.starts_with(prefix) {
                        debug!("sweeping stale namespace: {}", name);
                        if self.remove(&name).await.is_ok() {
                            cleaned += 1;
                        }
                    }
                }
            }
        }
        cleaned
    }

    pub fn fd(&self, name: &str) -> Result<RawFd, NetNsError> {
        self.namespaces
            .get(name)
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| NetNsError::NotFound(name.to_string()))
    }

    /// Enter a namespace on the current thread; the guard restores the
    /// original namespace on drop.
    pub fn enter(&self, name: &str) -> Result<NamespaceGuard, NetNsError> {
        let file = self
            .namespaces
            .get(name)
            .ok_or_else(|| NetNsError::NotFound(name.to_string()))?;

        let original = OpenOptions::new()
            .read(true)
            .open("/proc/self/ns/net")
            .map_err(NetNsError::OpenNs)?;

        setns(file, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
        debug!("entered namespace: {}", name);

        Ok(NamespaceGuard {
            original,
            name: name.to_string(),
        })
    }

    /// Open a netlink handle bound inside the given namespace, for
    /// configuring interfaces after they have been moved there.
    pub fn netlink_handle(&self, name: &str) -> Result<Handle, NetNsError> {
        let _guard = self.enter(name)?;
        let (connection, handle, _) = new_connection().map_err(NetNsError::Connection)?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

impl Drop for NetNsManager {
    fn drop(&mut self) {
        // Synchronous best-effort sweep for abnormal exits; the scenario's
        // explicit teardown is the primary cleanup path.
        let names: Vec<String> = self.namespaces.keys().cloned().collect();
        for name in names {
            let ns_path = self.base_dir.join(&name);
            let _ = umount2(&ns_path, MntFlags::MNT_DETACH);
            if std::fs::remove_file(&ns_path).is_err() {
                let _ = std::process::Command::new("ip")
                    .args(["netns", "del", &name])
                    .status();
            }
        }
        self.namespaces.clear();
    }
}

/// RAII guard restoring the thread's original namespace.
pub struct NamespaceGuard {
    original: File,
    name: String,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            warn!("failed to leave namespace {}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "sudo-tests")]
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(feature = "sudo-tests")]
    async fn create_remove_is_idempotent() {
        let mut manager = NetNsManager::new().unwrap();
        manager.create("chaos-test-ns").await.unwrap();
        manager.remove("chaos-test-ns").await.unwrap();
        // Removing again must not error.
        manager.remove("chaos-test-ns").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(feature = "sudo-tests")]
    async fn created_namespace_is_distinct_from_root() {
        use std::os::unix::fs::MetadataExt;

        let mut manager = NetNsManager::new().unwrap();
        manager.create("chaos-test-iso").await.unwrap();

        // The bind-mounted file must name a netns other than the caller's;
        // identical inodes would mean the "namespace" aliases the root one.
        let ns_ino = std::fs::metadata("/var/run/netns/chaos-test-iso")
            .unwrap()
            .ino();
        let root_ino = std::fs::metadata("/proc/self/ns/net").unwrap().ino();
        assert_ne!(ns_ino, root_ino, "namespace must not alias the root netns");

        // The pooled blocking thread was restored: work scheduled after the
        // create still sees the root namespace.
        let pooled_ino = tokio::task::spawn_blocking(|| {
            std::fs::metadata("/proc/thread-self/ns/net").unwrap().ino()
        })
        .await
        .unwrap();
        assert_eq!(pooled_ino, root_ino);

        manager.remove("chaos-test-iso").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[cfg(feature = "sudo-tests")]
    async fn sweep_cleans_prefixed_namespaces() {
        let mut manager = NetNsManager::new().unwrap();
        manager.create("chaos-test-sweep1").await.unwrap();
        manager.create("chaos-test-sweep2").await.unwrap();
        let cleaned = manager.sweep_stale("chaos-test-sweep").await;
        assert_eq!(cleaned, 2);
    }
}

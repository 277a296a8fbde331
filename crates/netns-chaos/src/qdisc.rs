//! Traffic-control application for impairment specs.
//!
//! Impairments are applied with `ip netns exec <ns> tc qdisc replace`, which
//! atomically swaps the root qdisc on the target device: applying a profile
//! replaces whatever impairment was active, it never stacks. Pure bandwidth
//! caps use a tbf shaper; everything else uses netem. `IP_NETNS_DIR` is
//! pinned to the namespace manager's base directory so `tc` resolves the
//! same namespaces this crate created.

use fault_profiles::ImpairmentSpec;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum QdiscError {
    #[error("tc invocation failed: {0}")]
    Exec(std::io::Error),

    #[error("tc rejected qdisc in ns {ns} on {device}: {stderr}")]
    Rejected {
        ns: String,
        device: String,
        stderr: String,
    },
}

#[derive(Debug, Default)]
pub struct QdiscManager;

impl QdiscManager {
    pub fn new() -> Self {
        Self
    }

    /// Atomically replace the impairment state on `device` inside `ns`.
    pub async fn apply(
        &self,
        ns: &str,
        device: &str,
        spec: &ImpairmentSpec,
        netns_base_dir: &Path,
    ) -> Result<(), QdiscError> {
        let args = tc_replace_args(device, spec);
        debug!("tc in {}: {}", ns, args.join(" "));

        let output = Command::new("ip")
            .args(["netns", "exec", ns, "tc"])
            .args(&args)
            .env("IP_NETNS_DIR", netns_base_dir)
            .output()
            .await
            .map_err(QdiscError::Exec)?;

        if !output.status.success() {
            return Err(QdiscError::Rejected {
                ns: ns.to_string(),
                device: device.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        info!(
            "impairment replaced in {} on {} (delay={}ms jitter={}ms loss={}% rate={}kbit)",
            ns, device, spec.delay_ms, spec.jitter_ms, spec.loss_pct, spec.rate_kbit
        );
        Ok(())
    }

    /// Best-effort removal of the root qdisc; "no qdisc" is not an error.
    pub async fn clear(&self, ns: &str, device: &str, netns_base_dir: &Path) {
        let result = Command::new("ip")
            .args(["netns", "exec", ns, "tc", "qdisc", "del", "dev", device, "root"])
            .env("IP_NETNS_DIR", netns_base_dir)
            .output()
            .await;

        match result {
            Ok(output) if !output.status.success() => {
                debug!(
                    "qdisc del in {} on {}: {}",
                    ns,
                    device,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(_) => debug!("cleared qdisc in {} on {}", ns, device),
            Err(e) => warn!("tc qdisc del failed to run in {} on {}: {}", ns, device, e),
        }
    }
}

/// Build the `tc` argument vector for replacing the root qdisc.
///
/// Pure so the exact command shape is unit-testable without CAP_NET_ADMIN.
pub fn tc_replace_args(device: &str, spec: &ImpairmentSpec) -> Vec<String> {
    let mut args: Vec<String> = ["qdisc", "replace", "dev", device, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if spec.is_shaping() {
        // Token-bucket shaping with a bounded queue. Burst is sized to one
        // rate-quantum (rate/8 bytes per 10ms tick, floor 1600 bytes).
        let burst = ((spec.rate_kbit as u64 * 1000 / 8) / 100).max(1600);
        args.push("tbf".into());
        args.push("rate".into());
        args.push(format!("{}kbit", spec.rate_kbit));
        args.push("burst".into());
        args.push(format!("{}b", burst));
        args.push("latency".into());
        args.push(format!("{}ms", spec.queue_latency_ms));
        return args;
    }

    args.push("netem".into());
    if spec.delay_ms > 0 {
        args.push("delay".into());
        args.push(format!("{}ms", spec.delay_ms));
        if spec.jitter_ms > 0 {
            args.push(format!("{}ms", spec.jitter_ms));
            args.push("distribution".into());
            args.push("normal".into());
        }
    }
    if spec.loss_pct > 0.0 {
        args.push("loss".into());
        args.push(fmt_pct(spec.loss_pct));
    }
    // netem requires a delay for reordering to act on.
    if spec.reorder_pct > 0.0 && spec.delay_ms > 0 {
        args.push("reorder".into());
        args.push(fmt_pct(spec.reorder_pct));
    }
    if spec.duplicate_pct > 0.0 {
        args.push("duplicate".into());
        args.push(fmt_pct(spec.duplicate_pct));
    }
    if spec.corrupt_pct > 0.0 {
        args.push("corrupt".into());
        args.push(fmt_pct(spec.corrupt_pct));
    }
    args
}

fn fmt_pct(value: f32) -> String {
    format!("{:.4}%", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fault_profiles::{FaultProfile, ProfilePlan};

    fn resolve_static(profile: FaultProfile, seed: u64) -> ImpairmentSpec {
        match profile.resolve(seed) {
            ProfilePlan::Static(spec) => spec,
            other => panic!("expected static plan, got {other:?}"),
        }
    }

    #[test]
    fn baseline_builds_full_netem_command() {
        let spec = resolve_static(FaultProfile::Baseline, 1);
        let args = tc_replace_args("veth-pub", &spec);
        let line = args.join(" ");

        assert!(line.starts_with("qdisc replace dev veth-pub root netem"));
        assert!(line.contains("delay 80ms 40ms distribution normal"));
        assert!(line.contains("loss "));
        assert!(line.contains("reorder "));
        assert!(line.contains("duplicate 1.0000%"));
        assert!(line.contains("corrupt 0.0500%"));
        assert!(!line.contains("tbf"));
    }

    #[test]
    fn partition_is_loss_only() {
        let spec = resolve_static(FaultProfile::PartitionBurst, 1);
        let args = tc_replace_args("veth-sub", &spec);
        assert_eq!(
            args.join(" "),
            "qdisc replace dev veth-sub root netem loss 100.0000%"
        );
    }

    #[test]
    fn shaping_selects_tbf_with_latency_bound() {
        let spec = resolve_static(FaultProfile::ThrottleLow, 1);
        let args = tc_replace_args("veth-pub", &spec);
        let line = args.join(" ");

        assert!(line.contains("tbf rate 512kbit"));
        assert!(line.contains("latency 50ms"));
        assert!(line.contains("burst "));
        assert!(!line.contains("netem"));
    }

    #[test]
    fn reorder_is_suppressed_without_delay() {
        let spec = ImpairmentSpec {
            delay_ms: 0,
            jitter_ms: 0,
            loss_pct: 0.0,
            reorder_pct: 25.0,
            duplicate_pct: 0.0,
            corrupt_pct: 0.0,
            rate_kbit: 0,
            queue_latency_ms: 0,
        };
        let line = tc_replace_args("veth-x", &spec).join(" ");
        assert!(!line.contains("reorder"));
    }

    #[test]
    fn identical_seed_builds_identical_command() {
        let a = tc_replace_args("d0", &resolve_static(FaultProfile::Baseline, 99));
        let b = tc_replace_args("d0", &resolve_static(FaultProfile::Baseline, 99));
        assert_eq!(a, b);
    }
}

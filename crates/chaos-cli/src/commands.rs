//! Command implementations for the chaos CLI.

use anyhow::{bail, Context, Result};
use netns_chaos::{run_scenario, teardown_shape, ChaosConfig, Transport, TopologyShape};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Run one scenario. Returns the process exit code: 0 on a passing run,
/// 1 on a failing or aborted run, 2 on unusable arguments.
pub async fn cmd_scenario(
    shape: &str,
    transport: &str,
    seed: u64,
    duration_secs: u64,
) -> Result<i32> {
    let shape: TopologyShape = match shape.parse() {
        Ok(shape) => shape,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(2);
        }
    };
    let transport: Transport = match transport.parse() {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(2);
        }
    };

    let cfg = ChaosConfig::from_env();
    preflight(&cfg)?;

    info!(
        "scenario {} over {} (seed {}, {}s)",
        shape, transport, seed, duration_secs
    );
    let outcome = run_scenario(
        shape,
        transport,
        seed,
        Duration::from_secs(duration_secs),
        &cfg,
    )
    .await
    .context("scenario run failed")?;

    let verdict = if outcome.pass { "pass" } else { "fail" };
    eprintln!("RESULT {verdict} {shape} {transport} seed={seed}");
    eprintln!("artifacts: {}", outcome.run_dir.display());

    Ok(if outcome.pass { 0 } else { 1 })
}

/// Tear down whatever a crashed run of `shape` left behind. Safe to invoke
/// when nothing is left; every step is best-effort.
pub async fn cmd_cleanup(shape: &str) -> Result<i32> {
    let shape: TopologyShape = match shape.parse() {
        Ok(shape) => shape,
        Err(e) => {
            eprintln!("error: {e}");
            return Ok(2);
        }
    };

    teardown_shape(shape).await.context("cleanup failed")?;
    eprintln!("cleaned up {shape} topology");
    Ok(0)
}

/// Fail fast on environments where provisioning cannot possibly succeed.
fn preflight(cfg: &ChaosConfig) -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("network-namespace scenarios require Linux");
    }
    for tool in ["ip", "tc"] {
        if !binary_available(tool) {
            bail!("required tool '{tool}' not found on PATH (iproute2)");
        }
    }
    if !binary_available(&cfg.node_bin) {
        bail!(
            "node binary '{}' not found (set CHAOS_NODE_BIN or put it on PATH)",
            cfg.node_bin
        );
    }
    Ok(())
}

/// Resolve a binary either as an explicit path or by searching PATH.
fn binary_available(name: &str) -> bool {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file();
    }
    match std::env::var_os("PATH") {
        Some(paths) => std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()),
        None => false,
    }
}

//! Per-shape scenario sequencers.
//!
//! A scenario provisions its topology, launches the roles, drives a fixed
//! fault timeline against the link endpoints, and waits for the roles to
//! exit. All timeline offsets are absolute from the moment the last role
//! was launched, so a slow fault application never shifts later events.
//!
//! Teardown is unconditional: the run body's result is captured, the
//! topology is destroyed, and only then does the result propagate. A run
//! that fails mid-timeline terminates every role it spawned before
//! returning, so no child outlives its namespaces.

use crate::config::ChaosConfig;
use crate::faults::FaultInjector;
use crate::process::{Role, RoleProcess, RoleSpec, Transport};
use crate::recorder::RunRecorder;
use crate::topology::{LinkEndpoint, Topology, TopologyManager, TopologyShape};
use crate::ChaosError;
use fault_profiles::FaultProfile;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What a finished (or aborted) scenario left behind.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// True when every role exited successfully.
    pub pass: bool,
    /// Artifact directory for this run.
    pub run_dir: PathBuf,
}

/// Run one scenario end to end.
///
/// `duration` is the nominal run length handed to duration-bounded roles;
/// process-exit waits are bounded by `duration` plus a fixed grace window.
pub async fn run_scenario(
    shape: TopologyShape,
    transport: Transport,
    seed: u64,
    duration: Duration,
    cfg: &ChaosConfig,
) -> Result<ScenarioOutcome, ChaosError> {
    let recorder = RunRecorder::begin(&cfg.out_dir, shape.name(), transport.as_str(), seed)?;
    info!(
        "run {} {} seed={} duration={:?} -> {}",
        shape,
        transport,
        seed,
        duration,
        recorder.run_dir().display()
    );
    if cfg.metrics {
        recorder.start_metrics_sampler(cfg.metrics_interval);
    }

    let mut manager = TopologyManager::new().await?;
    let injector = FaultInjector::new(seed);

    let ctx = ScenarioContext {
        cfg,
        recorder: &recorder,
        injector: &injector,
        transport,
        duration,
    };

    // The run body may fail at any point; teardown happens regardless, and
    // its own failures never mask the body's result.
    let result = run_shape(shape, &mut manager, &ctx).await;

    manager.teardown(shape).await;
    recorder.stop_metrics_sampler().await;

    let pass = matches!(result, Ok(true));
    recorder.finish(pass, shape.name(), transport.as_str(), seed);
    if let Err(e) = &result {
        error!("scenario aborted: {}", e);
    }

    let pass = result?;
    Ok(ScenarioOutcome {
        pass,
        run_dir: recorder.run_dir().to_path_buf(),
    })
}

struct ScenarioContext<'a> {
    cfg: &'a ChaosConfig,
    recorder: &'a RunRecorder,
    injector: &'a FaultInjector,
    transport: Transport,
    duration: Duration,
}

/// Grace window added on top of the nominal duration before a lingering
/// role is hard-killed.
const EXIT_GRACE: Duration = Duration::from_secs(30);

impl ScenarioContext<'_> {
    /// Assemble the spec for one role instance on one endpoint.
    fn role_spec(
        &self,
        endpoint: &LinkEndpoint,
        role: Role,
        dial: Option<String>,
        run_ms: Option<u64>,
    ) -> Result<RoleSpec, ChaosError> {
        Ok(RoleSpec {
            member: endpoint.member.clone(),
            role,
            transport: self.transport,
            namespace: endpoint.namespace.clone(),
            bind_ip: endpoint.ip,
            store_dir: self.recorder.store_dir(&endpoint.member)?,
            ready_file: role
                .writes_ready_artifact()
                .then(|| self.recorder.ready_file(&endpoint.member)),
            dial,
            run_ms,
            exit_timeout: self.duration + EXIT_GRACE,
        })
    }

    async fn spawn(
        &self,
        manager: &TopologyManager,
        spec: RoleSpec,
    ) -> Result<RoleProcess, ChaosError> {
        self.recorder.log_schedule("spawn", &spec.member);
        RoleProcess::spawn(
            &self.cfg.node_bin,
            manager.netns_base_dir(),
            spec,
            self.recorder,
        )
        .await
    }

    /// Await a role's readiness artifact. On timeout the partial process is
    /// terminated before the error propagates, so an aborted setup never
    /// strands a child.
    async fn await_ready(&self, process: &mut RoleProcess) -> Result<String, ChaosError> {
        match process
            .await_ready(self.cfg.ready_attempts, self.cfg.ready_interval)
            .await
        {
            Ok(address) => Ok(address),
            Err(e) => {
                warn!("{} never became ready, terminating", process.member());
                let _ = process.terminate(false).await;
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        manager: &TopologyManager,
        endpoint: &LinkEndpoint,
        profile: FaultProfile,
    ) -> Result<(), ChaosError> {
        self.injector
            .apply(manager, endpoint, profile, self.recorder)
            .await
    }
}

/// Hard-terminate every live role after a mid-run failure.
async fn abort_all(roles: Vec<RoleProcess>) {
    for mut process in roles {
        let _ = process.terminate(false).await;
    }
}

/// Collect exit statuses from all roles. Each wait is individually bounded
/// by the role's own timeout; wait errors count as failures rather than
/// aborting the collection, so every role still gets reaped.
async fn wait_all(processes: Vec<RoleProcess>) -> bool {
    let mut pass = true;
    for mut process in processes {
        match process.wait_exit().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} exited unsuccessfully", process.member());
                pass = false;
            }
            Err(e) => {
                warn!("waiting for {} failed: {}", process.member(), e);
                let _ = process.terminate(false).await;
                pass = false;
            }
        }
    }
    pass
}

async fn run_shape(
    shape: TopologyShape,
    manager: &mut TopologyManager,
    ctx: &ScenarioContext<'_>,
) -> Result<bool, ChaosError> {
    let topology = manager.provision(shape).await?;
    match shape {
        TopologyShape::Pair => run_pair(&topology, manager, ctx).await,
        TopologyShape::Line => run_line(&topology, manager, ctx).await,
        TopologyShape::Star => run_star(&topology, manager, ctx).await,
        TopologyShape::Throttle => run_throttle(&topology, manager, ctx).await,
    }
}

/// Publisher and subscriber on a direct link. Exercises a hard partition,
/// an optional subscriber stall, and a latency spike, with recovery after
/// each.
async fn run_pair(
    topology: &Topology,
    manager: &TopologyManager,
    ctx: &ScenarioContext<'_>,
) -> Result<bool, ChaosError> {
    let pub_ep = topology.endpoint("pub")?;
    let sub_ep = topology.endpoint("sub")?;

    ctx.apply(manager, pub_ep, FaultProfile::Baseline).await?;
    ctx.apply(manager, sub_ep, FaultProfile::Baseline).await?;

    let mut sub = ctx
        .spawn(manager, ctx.role_spec(sub_ep, Role::Sub, None, None)?)
        .await?;
    let sub_addr = ctx.await_ready(&mut sub).await?;

    let publisher = match ctx
        .spawn(
            manager,
            ctx.role_spec(pub_ep, Role::Pub, Some(sub_addr), None)?,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            abort_all(vec![sub]).await;
            return Err(e);
        }
    };

    if let Err(e) = pair_timeline(ctx, manager, pub_ep, &mut sub).await {
        abort_all(vec![publisher, sub]).await;
        return Err(e);
    }

    Ok(wait_all(vec![publisher, sub]).await)
}

async fn pair_timeline(
    ctx: &ScenarioContext<'_>,
    manager: &TopologyManager,
    pub_ep: &LinkEndpoint,
    sub: &mut RoleProcess,
) -> Result<(), ChaosError> {
    let start = Instant::now();

    tokio::time::sleep_until(start + Duration::from_millis(1500)).await;
    ctx.apply(manager, pub_ep, FaultProfile::PartitionBurst)
        .await?;
    tokio::time::sleep_until(start + Duration::from_millis(2500)).await;
    ctx.apply(manager, pub_ep, FaultProfile::Recover).await?;

    if !ctx.cfg.sub_pause.is_zero() {
        tokio::time::sleep_until(start + Duration::from_millis(3000)).await;
        ctx.recorder.log_schedule("pause", sub.member());
        sub.pause()?;
        tokio::time::sleep(ctx.cfg.sub_pause).await;
        ctx.recorder.log_schedule("resume", sub.member());
        sub.resume()?;
    }

    tokio::time::sleep_until(start + Duration::from_millis(5000)).await;
    ctx.apply(manager, pub_ep, FaultProfile::JitterSpike).await?;
    tokio::time::sleep_until(start + Duration::from_millis(7000)).await;
    ctx.apply(manager, pub_ep, FaultProfile::Recover).await
}

/// Three-hop relay path on a bridge. Exercises link flapping and a mid-run
/// relay restart (graceful or crash-like), then a latency spike.
async fn run_line(
    topology: &Topology,
    manager: &TopologyManager,
    ctx: &ScenarioContext<'_>,
) -> Result<bool, ChaosError> {
    let pub_ep = topology.endpoint("pub")?;
    let relay_ep = topology.endpoint("relay")?;
    let sub_ep = topology.endpoint("sub")?;

    for endpoint in topology.endpoints() {
        ctx.apply(manager, endpoint, FaultProfile::Baseline).await?;
    }

    let mut sub = ctx
        .spawn(manager, ctx.role_spec(sub_ep, Role::Sub, None, None)?)
        .await?;
    let sub_addr = ctx.await_ready(&mut sub).await?;

    let mut relay = match ctx
        .spawn(
            manager,
            ctx.role_spec(
                relay_ep,
                Role::Relay,
                Some(sub_addr),
                Some(ctx.duration.as_millis() as u64),
            )?,
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            abort_all(vec![sub]).await;
            return Err(e);
        }
    };
    let relay_addr = match ctx.await_ready(&mut relay).await {
        Ok(addr) => addr,
        Err(e) => {
            // await_ready already terminated the relay.
            abort_all(vec![sub]).await;
            return Err(e);
        }
    };

    let publisher = match ctx
        .spawn(
            manager,
            ctx.role_spec(pub_ep, Role::Pub, Some(relay_addr), None)?,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            abort_all(vec![sub, relay]).await;
            return Err(e);
        }
    };

    // The relay slot changes identity across the restart; the timeline owns
    // it through an Option so a failed restart leaves nothing to double-kill.
    let mut relay_slot = Some(relay);
    if let Err(e) = line_timeline(ctx, manager, relay_ep, &mut relay_slot).await {
        let mut live = vec![publisher, sub];
        live.extend(relay_slot);
        abort_all(live).await;
        return Err(e);
    }

    let mut roles = vec![publisher, sub];
    roles.extend(relay_slot);
    Ok(wait_all(roles).await)
}

async fn line_timeline(
    ctx: &ScenarioContext<'_>,
    manager: &TopologyManager,
    relay_ep: &LinkEndpoint,
    relay_slot: &mut Option<RoleProcess>,
) -> Result<(), ChaosError> {
    let start = Instant::now();

    tokio::time::sleep_until(start + Duration::from_millis(1000)).await;
    ctx.apply(manager, relay_ep, FaultProfile::Flap).await?;

    tokio::time::sleep_until(start + Duration::from_millis(4500)).await;
    if let Some(relay) = relay_slot.take() {
        let hard = ctx.cfg.relay_hard_kill;
        ctx.recorder.log_schedule(
            if hard { "restart:hard" } else { "restart:graceful" },
            relay.member(),
        );
        let mut relay = relay.restart(hard).await?;
        // The restarted relay must announce a fresh address before the
        // timeline continues; a relay that cannot come back fails the run.
        ctx.await_ready(&mut relay).await?;
        *relay_slot = Some(relay);
    }

    tokio::time::sleep_until(start + Duration::from_millis(6000)).await;
    ctx.apply(manager, relay_ep, FaultProfile::JitterSpike)
        .await?;
    tokio::time::sleep_until(start + Duration::from_millis(8000)).await;
    ctx.apply(manager, relay_ep, FaultProfile::Recover).await
}

/// Hub plus three leaves on a bridge: leaf1 receives, leaf3 publishes
/// through the hub. The receiving leaf is launched first so the hub's dial
/// target exists at spawn time.
async fn run_star(
    topology: &Topology,
    manager: &TopologyManager,
    ctx: &ScenarioContext<'_>,
) -> Result<bool, ChaosError> {
    let hub_ep = topology.endpoint("hub")?;
    let leaf1_ep = topology.endpoint("leaf1")?;
    let leaf2_ep = topology.endpoint("leaf2")?;
    let leaf3_ep = topology.endpoint("leaf3")?;

    for endpoint in topology.endpoints() {
        ctx.apply(manager, endpoint, FaultProfile::Baseline).await?;
    }

    let mut leaf1 = ctx
        .spawn(manager, ctx.role_spec(leaf1_ep, Role::Sub, None, None)?)
        .await?;
    let leaf1_addr = ctx.await_ready(&mut leaf1).await?;

    let mut hub = match ctx
        .spawn(
            manager,
            ctx.role_spec(
                hub_ep,
                Role::Relay,
                Some(leaf1_addr),
                Some(ctx.duration.as_millis() as u64),
            )?,
        )
        .await
    {
        Ok(h) => h,
        Err(e) => {
            abort_all(vec![leaf1]).await;
            return Err(e);
        }
    };
    let hub_addr = match ctx.await_ready(&mut hub).await {
        Ok(addr) => addr,
        Err(e) => {
            abort_all(vec![leaf1]).await;
            return Err(e);
        }
    };

    let mut leaf2 = match ctx
        .spawn(manager, ctx.role_spec(leaf2_ep, Role::Sub, None, None)?)
        .await
    {
        Ok(l) => l,
        Err(e) => {
            abort_all(vec![leaf1, hub]).await;
            return Err(e);
        }
    };
    if let Err(e) = ctx.await_ready(&mut leaf2).await {
        abort_all(vec![leaf1, hub]).await;
        return Err(e);
    }

    let publisher = match ctx
        .spawn(
            manager,
            ctx.role_spec(leaf3_ep, Role::Pub, Some(hub_addr), None)?,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            abort_all(vec![leaf1, hub, leaf2]).await;
            return Err(e);
        }
    };

    if let Err(e) = star_timeline(ctx, manager, hub_ep, leaf1_ep).await {
        abort_all(vec![publisher, hub, leaf1, leaf2]).await;
        return Err(e);
    }

    Ok(wait_all(vec![publisher, hub, leaf1, leaf2]).await)
}

async fn star_timeline(
    ctx: &ScenarioContext<'_>,
    manager: &TopologyManager,
    hub_ep: &LinkEndpoint,
    leaf1_ep: &LinkEndpoint,
) -> Result<(), ChaosError> {
    let start = Instant::now();

    tokio::time::sleep_until(start + Duration::from_millis(2000)).await;
    ctx.apply(manager, leaf1_ep, FaultProfile::PartitionBurst)
        .await?;
    tokio::time::sleep_until(start + Duration::from_millis(3500)).await;
    ctx.apply(manager, leaf1_ep, FaultProfile::Recover).await?;

    tokio::time::sleep_until(start + Duration::from_millis(5000)).await;
    ctx.apply(manager, hub_ep, FaultProfile::JitterSpike).await?;
    tokio::time::sleep_until(start + Duration::from_millis(7000)).await;
    ctx.apply(manager, hub_ep, FaultProfile::Recover).await
}

/// Pair wiring under bandwidth shaping: a low cap, a fluctuating cap, then
/// recovery to the seeded baseline.
async fn run_throttle(
    topology: &Topology,
    manager: &TopologyManager,
    ctx: &ScenarioContext<'_>,
) -> Result<bool, ChaosError> {
    let pub_ep = topology.endpoint("pub")?;
    let sub_ep = topology.endpoint("sub")?;

    ctx.apply(manager, pub_ep, FaultProfile::Baseline).await?;
    ctx.apply(manager, sub_ep, FaultProfile::Baseline).await?;

    let mut sub = ctx
        .spawn(manager, ctx.role_spec(sub_ep, Role::Sub, None, None)?)
        .await?;
    let sub_addr = ctx.await_ready(&mut sub).await?;

    let publisher = match ctx
        .spawn(
            manager,
            ctx.role_spec(pub_ep, Role::Pub, Some(sub_addr), None)?,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            abort_all(vec![sub]).await;
            return Err(e);
        }
    };

    if let Err(e) = throttle_timeline(ctx, manager, pub_ep).await {
        abort_all(vec![publisher, sub]).await;
        return Err(e);
    }

    Ok(wait_all(vec![publisher, sub]).await)
}

async fn throttle_timeline(
    ctx: &ScenarioContext<'_>,
    manager: &TopologyManager,
    pub_ep: &LinkEndpoint,
) -> Result<(), ChaosError> {
    let start = Instant::now();

    tokio::time::sleep_until(start + Duration::from_millis(1000)).await;
    ctx.apply(manager, pub_ep, FaultProfile::ThrottleLow).await?;

    tokio::time::sleep_until(start + Duration::from_millis(4000)).await;
    ctx.apply(manager, pub_ep, FaultProfile::ThrottleFluctuate)
        .await?;

    tokio::time::sleep_until(start + Duration::from_millis(8000)).await;
    ctx.apply(manager, pub_ep, FaultProfile::Recover).await
}

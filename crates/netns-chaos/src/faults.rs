//! Fault injection: resolving profiles against the run seed and driving
//! them onto topology endpoints.
//!
//! Static profiles are a single atomic qdisc replacement that persists until
//! the next application. Composite profiles are a timed sub-schedule of
//! replacements; applying one blocks the caller for the plan's run length,
//! which is why scenario timelines leave a gap at least that long before the
//! next event on the same endpoint.

use crate::recorder::RunRecorder;
use crate::topology::{LinkEndpoint, TopologyManager};
use crate::ChaosError;
use fault_profiles::{FaultProfile, ImpairmentSpec, ProfilePlan};
use std::time::Duration;
use tracing::{debug, info};

/// Seed-carrying fault driver. The same injector applied to the same
/// endpoint with the same profile always produces the same qdisc commands
/// in the same order.
pub struct FaultInjector {
    seed: u64,
}

impl FaultInjector {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Apply `profile` to one endpoint. Composite plans return only after
    /// their final step has been applied.
    pub async fn apply(
        &self,
        manager: &TopologyManager,
        endpoint: &LinkEndpoint,
        profile: FaultProfile,
        recorder: &RunRecorder,
    ) -> Result<(), ChaosError> {
        recorder.log_schedule(
            &format!("apply_profile:{}", profile.name()),
            &endpoint.member,
        );

        let steps = plan_steps(profile, self.seed);
        let composite = steps.len() > 1;
        info!(
            "applying {} to {} ({} step{})",
            profile.name(),
            endpoint.member,
            steps.len(),
            if composite { "s" } else { "" }
        );

        // Step offsets are relative to plan start and strictly increasing.
        let mut applied = Duration::ZERO;
        for (index, (at, spec)) in steps.iter().enumerate() {
            if *at > applied {
                debug!("waiting {:?} until step {}", *at - applied, index);
                tokio::time::sleep(*at - applied).await;
                applied = *at;
            }
            manager.apply_impairment(endpoint, spec).await?;
            if composite {
                recorder.log_schedule(
                    &format!("profile_step:{}:{}", profile.name(), index),
                    &endpoint.member,
                );
            }
        }
        Ok(())
    }
}

/// Flatten a profile plan into `(offset, spec)` steps. Static plans become a
/// single step at offset zero; composite plans keep their sub-schedule.
pub fn plan_steps(profile: FaultProfile, seed: u64) -> Vec<(Duration, ImpairmentSpec)> {
    match profile.resolve(seed) {
        ProfilePlan::Static(spec) => vec![(Duration::ZERO, spec)],
        ProfilePlan::Composite(steps) => steps,
    }
}

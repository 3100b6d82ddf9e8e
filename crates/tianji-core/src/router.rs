//! Deployment selection and health tracking.
//!
//! Health is tracked per deployment id in a `DashMap`. Selection filters
//! cooled-down deployments, prefers the lowest numeric priority tier, and
//! picks within the tier by weighted random. When every candidate is
//! cooling down the router serves from the full set anyway; stale health
//! beats a guaranteed 503.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use time::{Duration, OffsetDateTime};

use tianji_provider_core::Deployment;

const MAX_COOLDOWN_SECS: u64 = 60;

#[derive(Debug, Clone, Default)]
struct DeploymentHealth {
    consecutive_failures: u32,
    cooldown_until: Option<OffsetDateTime>,
}

/// How a finished attempt went, as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// Network errors, 5xx, and 429 without usable reset info.
    Transient,
    /// 429 with an explicit reset time.
    RateLimited { reset: Option<OffsetDateTime> },
    /// Non-retryable 4xx; surfaced immediately, no cooldown.
    Fatal,
    /// Client cancellation; no judgement either way.
    Neutral,
}

#[derive(Debug, Default)]
pub struct Router {
    health: DashMap<u64, DeploymentHealth>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a deployment from `group`, skipping `exclude` (deployments that
    /// already failed during this request).
    pub fn pick(
        &self,
        group: &[Arc<Deployment>],
        exclude: &HashSet<u64>,
    ) -> Option<Arc<Deployment>> {
        self.pick_at(group, exclude, OffsetDateTime::now_utc())
    }

    fn pick_at(
        &self,
        group: &[Arc<Deployment>],
        exclude: &HashSet<u64>,
        now: OffsetDateTime,
    ) -> Option<Arc<Deployment>> {
        let candidates: Vec<&Arc<Deployment>> = group
            .iter()
            .filter(|d| !exclude.contains(&d.id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let healthy: Vec<&Arc<Deployment>> = candidates
            .iter()
            .copied()
            .filter(|d| !self.is_cooling(d.id, now))
            .collect();
        let pool = if healthy.is_empty() { &candidates } else { &healthy };

        let best_priority = pool.iter().map(|d| d.priority).min()?;
        let tier: Vec<&Arc<Deployment>> = pool
            .iter()
            .copied()
            .filter(|d| d.priority == best_priority)
            .collect();

        Some(Arc::clone(weighted_pick(&tier)))
    }

    fn is_cooling(&self, id: u64, now: OffsetDateTime) -> bool {
        self.health
            .get(&id)
            .and_then(|h| h.cooldown_until)
            .is_some_and(|until| until > now)
    }

    pub fn report(&self, deployment_id: u64, outcome: Outcome) {
        self.report_at(deployment_id, outcome, OffsetDateTime::now_utc());
    }

    fn report_at(&self, deployment_id: u64, outcome: Outcome, now: OffsetDateTime) {
        match outcome {
            Outcome::Success => {
                self.health.insert(deployment_id, DeploymentHealth::default());
            }
            Outcome::Transient => {
                let mut entry = self.health.entry(deployment_id).or_default();
                entry.consecutive_failures += 1;
                entry.cooldown_until = Some(now + backoff(entry.consecutive_failures));
            }
            Outcome::RateLimited { reset } => {
                let mut entry = self.health.entry(deployment_id).or_default();
                entry.consecutive_failures += 1;
                let until = now + backoff(entry.consecutive_failures);
                entry.cooldown_until = Some(match reset {
                    Some(reset) if reset > until => reset,
                    _ => until,
                });
            }
            Outcome::Fatal | Outcome::Neutral => {}
        }
    }

    /// Remaining cooldown for observability endpoints.
    pub fn cooldown_remaining(&self, deployment_id: u64) -> Option<Duration> {
        let now = OffsetDateTime::now_utc();
        self.health
            .get(&deployment_id)
            .and_then(|h| h.cooldown_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

fn backoff(failures: u32) -> Duration {
    let secs = 2u64
        .checked_pow(failures)
        .unwrap_or(MAX_COOLDOWN_SECS)
        .min(MAX_COOLDOWN_SECS);
    Duration::seconds(secs as i64)
}

fn weighted_pick<'a>(tier: &[&'a Arc<Deployment>]) -> &'a Arc<Deployment> {
    if tier.len() == 1 {
        return tier[0];
    }
    let total: u64 = tier.iter().map(|d| d.weight.max(1) as u64).sum();
    let mut roll = rand::rng().random_range(0..total);
    for d in tier {
        let w = d.weight.max(1) as u64;
        if roll < w {
            return d;
        }
        roll -= w;
    }
    tier[tier.len() - 1]
}

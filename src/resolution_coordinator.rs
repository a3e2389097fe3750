//! Resolution runs: cache check, paced lookup, matching, persistence.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::LookupConfig;
use crate::error::{LookupError, ResolutionError};
use crate::lookup::{LookupCandidate, LookupService};
use crate::matching::{MatchOutcome, MatchingEngine};
use crate::name_store::NameStore;
use crate::protocol::{ResolutionRecord, ResolutionSource};
use crate::request_pacer::RequestPacer;

/// Source of canonical names typed in by a person.
///
/// Consulted only after a lookup confidently found nothing.
pub trait ManualResolver {
    /// Returns the canonical name to store, or `None` to keep the name unresolved.
    fn resolve_manually(
        &mut self,
        localized_name: &str,
        candidates: &[LookupCandidate],
    ) -> Option<String>;
}

/// Bounded exponential backoff for transient lookup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LookupConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1u32 << exponent;
        self.backoff_base
            .checked_mul(multiplier)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Counts and names produced by one resolution run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    /// Names newly stored with a matched status.
    pub resolved: Vec<String>,
    /// Names answered from the cache without a lookup.
    pub skipped: Vec<String>,
    /// Names newly stored as `not_found`.
    pub unresolved: Vec<String>,
    /// Registry requests sent, retries included.
    pub lookups_issued: usize,
    pub interrupted: bool,
    /// Names not processed because the deadline passed.
    pub remaining: Vec<String>,
}

enum LookupAttempt {
    Candidates(Vec<LookupCandidate>),
    Failed { message: String },
    Interrupted,
}

/// Drives the lookup of every uncached name through the rate gate.
pub struct ResolutionCoordinator<'a> {
    store: &'a NameStore,
    lookup: &'a dyn LookupService,
    engine: MatchingEngine,
    pacer: RequestPacer,
    retry: RetryPolicy,
    deadline: Option<Instant>,
    manual_resolver: Option<Box<dyn ManualResolver + 'a>>,
}

impl<'a> ResolutionCoordinator<'a> {
    pub fn new(
        store: &'a NameStore,
        lookup: &'a dyn LookupService,
        engine: MatchingEngine,
        pacer: RequestPacer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            lookup,
            engine,
            pacer,
            retry,
            deadline: None,
            manual_resolver: None,
        }
    }

    pub fn from_config(
        store: &'a NameStore,
        lookup: &'a dyn LookupService,
        config: &LookupConfig,
    ) -> Result<Self, ResolutionError> {
        Ok(Self::new(
            store,
            lookup,
            MatchingEngine::new(config.min_score),
            RequestPacer::new(Duration::from_millis(config.request_interval_ms))?,
            RetryPolicy::from_config(config),
        ))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_manual_resolver(mut self, resolver: Box<dyn ManualResolver + 'a>) -> Self {
        self.manual_resolver = Some(resolver);
        self
    }

    /// Resolves every name not already settled in the store.
    ///
    /// Stops at the first store write failure. Names left when the deadline
    /// passes are returned in `remaining`.
    pub fn run<S: AsRef<str>>(
        &mut self,
        localized_names: &[S],
    ) -> Result<ResolutionSummary, ResolutionError> {
        let names = distinct_names(localized_names);
        info!(
            "Resolve: starting run names={} interval={:?} max_attempts={}",
            names.len(),
            self.pacer.interval(),
            self.retry.max_attempts
        );

        let mut summary = ResolutionSummary::default();
        for (index, name) in names.iter().enumerate() {
            if self.deadline_passed() {
                summary.interrupted = true;
                summary.remaining = names[index..].to_vec();
                break;
            }

            if let Some(existing) = self.store.get(name)? {
                if !existing.needs_lookup() {
                    debug!(
                        "Resolve[{}]: cached status={}",
                        name,
                        existing.status.as_str()
                    );
                    summary.skipped.push(name.clone());
                    continue;
                }
            }

            let record = match self.lookup_with_retries(name, &mut summary.lookups_issued) {
                LookupAttempt::Interrupted => {
                    summary.interrupted = true;
                    summary.remaining = names[index..].to_vec();
                    break;
                }
                LookupAttempt::Failed { message } => {
                    warn!("Resolve[{}]: lookup failed, retrying next run: {}", name, message);
                    ResolutionRecord::not_found(name.as_str(), true)
                }
                LookupAttempt::Candidates(candidates) => self.decide(name, &candidates),
            };

            if let Err(err) = self.store.put(&record) {
                error!("Resolve[{}]: aborting run, store write failed: {}", name, err);
                return Err(err.into());
            }
            if record.status.is_matched() {
                summary.resolved.push(name.clone());
            } else {
                summary.unresolved.push(name.clone());
            }
        }

        info!(
            "Resolve: run finished resolved={} skipped={} unresolved={} lookups={} interrupted={} remaining={}",
            summary.resolved.len(),
            summary.skipped.len(),
            summary.unresolved.len(),
            summary.lookups_issued,
            summary.interrupted,
            summary.remaining.len()
        );
        Ok(summary)
    }

    fn decide(&mut self, name: &str, candidates: &[LookupCandidate]) -> ResolutionRecord {
        match self.engine.resolve(name, candidates) {
            MatchOutcome::Matched {
                canonical_name,
                registry_id,
                status,
            } => {
                debug!(
                    "Resolve[{}]: matched canonical={} status={}",
                    name,
                    canonical_name,
                    status.as_str()
                );
                ResolutionRecord::matched(
                    name,
                    canonical_name,
                    ResolutionSource::Registry,
                    Some(registry_id),
                )
            }
            MatchOutcome::NotFound(reason) => {
                debug!(
                    "Resolve[{}]: not found reason={} candidates={}",
                    name,
                    reason.as_str(),
                    candidates.len()
                );
                let manual_name = self
                    .manual_resolver
                    .as_mut()
                    .and_then(|resolver| resolver.resolve_manually(name, candidates))
                    .map(|manual| manual.trim().to_string())
                    .filter(|manual| !manual.is_empty());
                match manual_name {
                    Some(manual) => {
                        info!("Resolve[{}]: manual canonical={}", name, manual);
                        ResolutionRecord::matched(name, manual, ResolutionSource::Manual, None)
                    }
                    None => ResolutionRecord::not_found(name, false),
                }
            }
        }
    }

    fn lookup_with_retries(&self, name: &str, lookups_issued: &mut usize) -> LookupAttempt {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !self.pacer.acquire(self.deadline) {
                info!("Resolve[{}]: deadline reached while waiting for rate gate", name);
                return LookupAttempt::Interrupted;
            }
            *lookups_issued += 1;
            match self.lookup.search(name) {
                Ok(candidates) => return LookupAttempt::Candidates(candidates),
                Err(LookupError::Rejected(message)) => {
                    return LookupAttempt::Failed { message };
                }
                Err(LookupError::Transient(message)) => {
                    if attempt >= self.retry.max_attempts {
                        return LookupAttempt::Failed { message };
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(
                        "Resolve[{}]: transient failure attempt {}/{}; retrying in {:?}: {}",
                        name, attempt, self.retry.max_attempts, delay, message
                    );
                    self.sleep_until_deadline(delay);
                }
            }
        }
    }

    fn sleep_until_deadline(&self, delay: Duration) {
        let delay = match self.deadline {
            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
            None => delay,
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Trimmed, non-empty names in first-occurrence order without duplicates.
fn distinct_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|name| name.as_ref().trim())
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

//! Drives the reconciliation managers of many adapters.
//!
//! The runner keeps its own table of last successful runs, so two runners
//! never share scheduling state. Managers that are due run concurrently; each
//! one still guards its own scope.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info};

use crate::error::Result;
use crate::external::{ExternalIdAdapter, ExternalIdManager, UpdateOutcome};
use crate::storage::ScopeMapPersister;

/// Object safe face of an [`ExternalIdManager`], whatever its external ID type.
#[async_trait]
pub trait Reconciler<S: ScopeMapPersister>: Send + Sync {
    fn scope(&self) -> &str;
    fn preferred_update_rate(&self) -> Duration;
    async fn update(&self, storage: &S) -> UpdateOutcome;
}

#[async_trait]
impl<A, S> Reconciler<S> for ExternalIdManager<A>
where
    A: ExternalIdAdapter,
    S: ScopeMapPersister,
{
    fn scope(&self) -> &str {
        ExternalIdManager::scope(self)
    }
    fn preferred_update_rate(&self) -> Duration {
        self.adapter().preferred_update_rate()
    }
    async fn update(&self, storage: &S) -> UpdateOutcome {
        ExternalIdManager::update(self, storage).await
    }
}

pub struct Runner<S: ScopeMapPersister> {
    reconcilers: Vec<Box<dyn Reconciler<S>>>,
    last_runs: HashMap<String, DateTime<Utc>>,
}

impl<S: ScopeMapPersister> Runner<S> {
    pub fn new() -> Self {
        Self {
            reconcilers: Vec::new(),
            last_runs: HashMap::new(),
        }
    }

    pub fn register(&mut self, reconciler: Box<dyn Reconciler<S>>) {
        info!(scope = reconciler.scope(), "registered reconciler");
        self.reconcilers.push(reconciler);
    }

    pub fn scopes(&self) -> HashSet<String> {
        self.reconcilers.iter().map(|r| r.scope().to_owned()).collect()
    }

    pub fn last_run(&self, scope: &str) -> Option<DateTime<Utc>> {
        self.last_runs.get(scope).copied()
    }

    fn is_due(last_run: Option<&DateTime<Utc>>, rate: Duration, now: DateTime<Utc>) -> bool {
        match last_run {
            None => true,
            Some(last) => now
                .signed_duration_since(*last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= rate),
        }
    }

    /// Runs every reconciler whose preferred update rate has elapsed since
    /// its last successful run.
    pub async fn run_due(&mut self, storage: &S, now: DateTime<Utc>) -> Vec<(String, UpdateOutcome)> {
        let last_runs = &self.last_runs;
        let due: Vec<&dyn Reconciler<S>> = self
            .reconcilers
            .iter()
            .map(|r| r.as_ref())
            .filter(|r| Self::is_due(last_runs.get(r.scope()), r.preferred_update_rate(), now))
            .collect();
        debug!(due = due.len(), registered = self.reconcilers.len(), "running due reconcilers");
        let outcomes = Self::run(due, storage).await;
        self.record(&outcomes, now);
        outcomes
    }

    /// Runs every reconciler regardless of schedule.
    pub async fn run_all(&mut self, storage: &S, now: DateTime<Utc>) -> Vec<(String, UpdateOutcome)> {
        let all: Vec<&dyn Reconciler<S>> = self.reconcilers.iter().map(|r| r.as_ref()).collect();
        let outcomes = Self::run(all, storage).await;
        self.record(&outcomes, now);
        outcomes
    }

    async fn run(reconcilers: Vec<&dyn Reconciler<S>>, storage: &S) -> Vec<(String, UpdateOutcome)> {
        join_all(reconcilers.into_iter().map(|r| async move {
            let outcome = r.update(storage).await;
            (r.scope().to_owned(), outcome)
        }))
        .await
    }

    fn record(&mut self, outcomes: &[(String, UpdateOutcome)], now: DateTime<Utc>) {
        for (scope, outcome) in outcomes {
            if outcome.success && !outcome.skipped {
                self.last_runs.insert(scope.clone(), now);
            }
        }
    }

    /// Drops persisted scope maps no registered reconciler owns.
    pub async fn cleanup_unused_scopes(&self, storage: &S) -> Result<usize> {
        let mut tx = storage.begin().await?;
        let deleted = storage.delete_unused_scopes(&self.scopes(), &mut tx).await?;
        storage.commit(tx).await?;
        if deleted > 0 {
            info!(deleted, "deleted unused scope maps");
        }
        Ok(deleted)
    }
}

impl<S: ScopeMapPersister> Default for Runner<S> {
    fn default() -> Self {
        Self::new()
    }
}

//! Reconciliation of external system identifiers with CI identities.
//!
//! Each adapter owns one scope: a persisted bidirectional table between CIIDs
//! and the adapter's external IDs. A reconciliation run fetches the adapter's
//! full inventory, maps every new external ID to a CI (reusing one found by
//! its identification method or creating one), recreates CIs that vanished
//! while still mapped, drops mappings of external IDs that are gone and
//! persists the table. Everything after the fetch happens in one transaction
//! that reads the scope map afresh, and only one run per scope is in flight at
//! a time, whichever manager starts it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use bimap::BiMap;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::construct::{Ciid, TimeThreshold};
use crate::error::{LayerkeeperError, Result};
use crate::identify::{CiCandidateAttributeData, IdentificationMethod, IdentificationService, MappingContext};
use crate::storage::{validate_scope, ScopeMapPersister};

// ------------- External IDs -------------
pub trait ExternalId: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {
    fn serialize_to_string(&self) -> String;
    fn deserialize(text: &str) -> Result<Self>;
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ExternalIdString(String);
impl ExternalIdString {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl ExternalId for ExternalIdString {
    fn serialize_to_string(&self) -> String {
        self.0.clone()
    }
    fn deserialize(text: &str) -> Result<Self> {
        Ok(Self(text.to_owned()))
    }
}
impl fmt::Display for ExternalIdString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External ID that is itself a UUID, typically used directly as the CIID.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ExternalIdUuid(Uuid);
impl ExternalIdUuid {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}
impl ExternalId for ExternalIdUuid {
    fn serialize_to_string(&self) -> String {
        self.0.to_string()
    }
    fn deserialize(text: &str) -> Result<Self> {
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|e| LayerkeeperError::DataCorruption {
                message: format!("'{}' is not a UUID external ID: {}", text, e),
            })
    }
}
impl fmt::Display for ExternalIdUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ------------- Scoped ID map -------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopedIdMap<E: ExternalId> {
    map: BiMap<Ciid, E>,
}

impl<E: ExternalId> ScopedIdMap<E> {
    pub fn new() -> Self {
        Self { map: BiMap::new() }
    }
    pub fn from_table(table: &HashMap<Ciid, String>) -> Result<Self> {
        let mut map = BiMap::new();
        for (ciid, text) in table {
            map.insert(*ciid, E::deserialize(text)?);
        }
        Ok(Self { map })
    }
    pub fn to_table(&self) -> HashMap<Ciid, String> {
        self.map
            .iter()
            .map(|(ciid, e)| (*ciid, e.serialize_to_string()))
            .collect()
    }
    pub fn ciid_of(&self, external_id: &E) -> Option<Ciid> {
        self.map.get_by_right(external_id).copied()
    }
    pub fn external_id_of(&self, ciid: &Ciid) -> Option<&E> {
        self.map.get_by_left(ciid)
    }
    pub fn contains_ciid(&self, ciid: &Ciid) -> bool {
        self.map.contains_left(ciid)
    }
    pub fn insert(&mut self, ciid: Ciid, external_id: E) {
        self.map.insert(ciid, external_id);
    }
    pub fn remove_external_id(&mut self, external_id: &E) -> Option<Ciid> {
        self.map.remove_by_right(external_id).map(|(ciid, _)| ciid)
    }
    pub fn external_ids(&self) -> impl Iterator<Item = &E> {
        self.map.right_values()
    }
    pub fn ciids(&self) -> impl Iterator<Item = &Ciid> {
        self.map.left_values()
    }
    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
impl<E: ExternalId> Default for ScopedIdMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- Adapters -------------
#[async_trait]
pub trait ExternalIdAdapter: Send + Sync {
    type Id: ExternalId;

    /// Name of the scope map this adapter owns.
    fn scope(&self) -> &str;

    async fn fetch_full_inventory(&self) -> Result<Vec<(Self::Id, IdentificationMethod)>>;

    async fn fetch_record_attributes(&self, external_id: &Self::Id) -> Result<Option<CiCandidateAttributeData>>;

    /// CIID to use for an external ID that matches no existing CI.
    fn derive_ciid(&self, _external_id: &Self::Id) -> Option<Ciid> {
        None
    }

    fn preferred_update_rate(&self) -> Duration {
        Duration::from_secs(300)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct UpdateOutcome {
    pub changed: bool,
    pub success: bool,
    pub skipped: bool,
}
impl UpdateOutcome {
    pub fn finished(changed: bool) -> Self {
        Self {
            changed,
            success: true,
            skipped: false,
        }
    }
    pub fn failed(changed: bool) -> Self {
        Self {
            changed,
            success: false,
            skipped: false,
        }
    }
    pub fn skipped() -> Self {
        Self {
            changed: false,
            success: true,
            skipped: true,
        }
    }
}

// ------------- Manager -------------
pub struct ExternalIdManager<A: ExternalIdAdapter> {
    adapter: A,
    timeout: Duration,
    // map as of the last committed run; runs always reload from storage
    committed: Mutex<Option<ScopedIdMap<A::Id>>>,
}

impl<A: ExternalIdAdapter> ExternalIdManager<A> {
    pub fn new(adapter: A, timeout: Duration) -> Result<Self> {
        validate_scope(adapter.scope())?;
        Ok(Self {
            adapter,
            timeout,
            committed: Mutex::new(None),
        })
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn scope(&self) -> &str {
        self.adapter.scope()
    }

    /// The scope map as committed by this manager's last successful run.
    pub async fn mapping(&self) -> Option<ScopedIdMap<A::Id>> {
        self.committed.lock().await.clone()
    }

    /// One guarded reconciliation run in its own transaction. A run already in
    /// flight for this scope, from any manager, makes this a skip.
    pub async fn update<S: ScopeMapPersister>(&self, storage: &S) -> UpdateOutcome {
        let span = info_span!("reconcile", scope = %self.adapter.scope());
        self.update_guarded(storage).instrument(span).await
    }

    async fn update_guarded<S: ScopeMapPersister>(&self, storage: &S) -> UpdateOutcome {
        let Ok(_running) = storage.scope_lock(self.adapter.scope()).try_lock_owned() else {
            info!("reconciliation already in flight, skipping");
            return UpdateOutcome::skipped();
        };

        let mut changed = false;
        let run = timeout(self.timeout, self.run(storage, &mut changed))
            .await
            .unwrap_or_else(|_| {
                Err(LayerkeeperError::Timeout {
                    scope: self.adapter.scope().to_owned(),
                    seconds: self.timeout.as_secs(),
                })
            });

        match run {
            Ok(map) => {
                *self.committed.lock().await = Some(map);
                info!(changed, "reconciliation finished");
                UpdateOutcome::finished(changed)
            }
            Err(e) => {
                warn!(error = %e, changed, "reconciliation failed, keeping previous mapping");
                UpdateOutcome::failed(changed)
            }
        }
    }

    // The inventory is fetched before the transaction opens, so a slow
    // adapter never holds the storage connection.
    async fn run<S: ScopeMapPersister>(&self, storage: &S, changed: &mut bool) -> Result<ScopedIdMap<A::Id>> {
        let inventory = self.adapter.fetch_full_inventory().await?;
        let mut tx = storage.begin().await?;
        match self.reconcile(storage, &mut tx, inventory, changed).await {
            Ok(map) => {
                storage.commit(tx).await?;
                Ok(map)
            }
            Err(e) => {
                if let Err(rollback) = storage.rollback(tx).await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Runs reconciliation inside a caller-owned transaction and reports
    /// whether the mapping changed. A run in flight for the scope makes this
    /// `Ok(false)` without touching anything. The caller commits or rolls
    /// back, so the committed snapshot is forgotten.
    pub async fn update_in<S: ScopeMapPersister>(&self, storage: &S, tx: &mut S::Tx) -> Result<bool> {
        let span = info_span!("reconcile", scope = %self.adapter.scope());
        self.update_in_guarded(storage, tx).instrument(span).await
    }

    async fn update_in_guarded<S: ScopeMapPersister>(&self, storage: &S, tx: &mut S::Tx) -> Result<bool> {
        let Ok(_running) = storage.scope_lock(self.adapter.scope()).try_lock_owned() else {
            info!("reconciliation already in flight, skipping");
            return Ok(false);
        };
        let inventory = self.adapter.fetch_full_inventory().await?;
        let mut changed = false;
        self.reconcile(storage, tx, inventory, &mut changed).await?;
        *self.committed.lock().await = None;
        Ok(changed)
    }

    async fn reconcile<S: ScopeMapPersister>(
        &self,
        storage: &S,
        tx: &mut S::Tx,
        inventory: Vec<(A::Id, IdentificationMethod)>,
        changed: &mut bool,
    ) -> Result<ScopedIdMap<A::Id>> {
        let scope = self.adapter.scope();
        let mut map = ScopedIdMap::from_table(&storage.load_scope(scope, tx).await?)?;

        let identification = IdentificationService::new(storage);
        let mut context = MappingContext::new(TimeThreshold::Latest);
        let mut present: HashSet<A::Id> = HashSet::with_capacity(inventory.len());
        for (external_id, method) in inventory {
            present.insert(external_id.clone());
            if let Some(ciid) = map.ciid_of(&external_id) {
                if !storage.ci_exists(ciid, tx).await? {
                    storage.create_ci(ciid, tx).await?;
                    *changed = true;
                    info!(ciid = %ciid, external_id = %external_id, "recreated CI");
                }
                continue;
            }

            let candidates = identification
                .try_to_match(&external_id.serialize_to_string(), &method, &mut context, tx)
                .await?;
            let unmapped = candidates.iter().find(|c| !map.contains_ciid(c)).copied();
            let ciid = match unmapped {
                Some(ciid) => ciid,
                None if !candidates.is_empty() => {
                    warn!(
                        external_id = %external_id,
                        candidates = candidates.len(),
                        "every matching CI is already mapped, creating a new CI"
                    );
                    Ciid::generate()
                }
                None => self
                    .adapter
                    .derive_ciid(&external_id)
                    .filter(|derived| !map.contains_ciid(derived))
                    .unwrap_or_else(Ciid::generate),
            };
            if !storage.ci_exists(ciid, tx).await? {
                storage.create_ci(ciid, tx).await?;
                info!(ciid = %ciid, external_id = %external_id, "created CI");
            }
            map.insert(ciid, external_id);
            *changed = true;
        }

        let stale: Vec<A::Id> = map
            .external_ids()
            .filter(|e| !present.contains(*e))
            .cloned()
            .collect();
        for external_id in stale {
            if let Some(ciid) = map.remove_external_id(&external_id) {
                info!(ciid = %ciid, external_id = %external_id, "dropped mapping");
            }
            *changed = true;
        }

        if *changed {
            storage.persist_scope(scope, &map.to_table(), tx).await?;
        }
        Ok(map)
    }
}

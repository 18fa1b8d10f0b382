//! Collaborator traits the core is written against.
//!
//! [`Storage`] is the transactional unit of work: CI existence, per-layer fact
//! versions, fact writes and changeset issuing. [`ScopeMapPersister`] keeps the
//! per-adapter CIID to external ID tables. The [`crate::persist::Persistor`]
//! implements both on SQLite; other engines can be plugged in by implementing
//! the same traits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;

use crate::construct::{
    Attribute, AttributeState, Changeset, ChangesetId, CiSelection, Ciid, Layer, LayerId,
    NameSelection, Predicate, Relation, RelationState, TimeThreshold,
};
use crate::datatype::AttributeValue;
use crate::error::{LayerkeeperError, Result};

lazy_static! {
    static ref SCOPE_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").unwrap();
}

/// Scope names end up as keys of persisted tables, so only a restricted
/// alphabet is accepted.
pub fn validate_scope(scope: &str) -> Result<()> {
    if SCOPE_NAME.is_match(scope) {
        Ok(())
    } else {
        Err(LayerkeeperError::InvalidScope(scope.to_owned()))
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Handle of one open transaction. Dropping it without commit rolls back.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> Result<()>;
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    // CIs
    async fn ci_exists(&self, ciid: Ciid, tx: &mut Self::Tx) -> Result<bool>;
    async fn create_ci(&self, ciid: Ciid, tx: &mut Self::Tx) -> Result<()>;
    async fn delete_ci(&self, ciid: Ciid, tx: &mut Self::Tx) -> Result<bool>;
    async fn ciids(&self, tx: &mut Self::Tx) -> Result<Vec<Ciid>>;

    // Layers and predicates
    async fn create_layer(&self, layer: &Layer, tx: &mut Self::Tx) -> Result<bool>;
    async fn layers(&self, tx: &mut Self::Tx) -> Result<Vec<Layer>>;
    async fn upsert_predicate(&self, predicate: &Predicate, tx: &mut Self::Tx) -> Result<()>;
    async fn predicates(&self, tx: &mut Self::Tx) -> Result<Vec<Predicate>>;

    // Changesets
    async fn create_changeset(
        &self,
        user_id: i64,
        timestamp: DateTime<Utc>,
        tx: &mut Self::Tx,
    ) -> Result<Changeset>;
    async fn changeset(&self, id: ChangesetId, tx: &mut Self::Tx) -> Result<Option<Changeset>>;

    /// Latest version per `(name, ciid)` in one layer that is visible at the
    /// threshold, removed versions included. Versions come back in the order their
    /// keys first appeared.
    async fn latest_attributes(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        names: &NameSelection,
        at: TimeThreshold,
        tx: &mut Self::Tx,
    ) -> Result<Vec<Attribute>>;

    /// Latest version per `(from, to, predicate)` in one layer visible at the
    /// threshold, removed versions included. A relation is selected when
    /// either endpoint is.
    async fn latest_relations(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        at: TimeThreshold,
        tx: &mut Self::Tx,
    ) -> Result<Vec<Relation>>;

    async fn write_attribute(
        &self,
        layer: &LayerId,
        name: &str,
        ciid: Ciid,
        value: &AttributeValue,
        state: AttributeState,
        changeset: &Changeset,
        tx: &mut Self::Tx,
    ) -> Result<Attribute>;

    async fn write_relation(
        &self,
        layer: &LayerId,
        from: Ciid,
        to: Ciid,
        predicate_id: &str,
        state: RelationState,
        changeset: &Changeset,
        tx: &mut Self::Tx,
    ) -> Result<Relation>;

    /// Live attribute versions of one layer at the threshold.
    async fn live_attributes(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        names: &NameSelection,
        at: TimeThreshold,
        tx: &mut Self::Tx,
    ) -> Result<Vec<Attribute>> {
        let mut attributes = self.latest_attributes(layer, selection, names, at, tx).await?;
        attributes.retain(|a| !a.is_removed());
        Ok(attributes)
    }

    /// Live relation versions of one layer at the threshold.
    async fn live_relations(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        at: TimeThreshold,
        tx: &mut Self::Tx,
    ) -> Result<Vec<Relation>> {
        let mut relations = self.latest_relations(layer, selection, at, tx).await?;
        relations.retain(|r| !r.is_removed());
        Ok(relations)
    }
}

/// Persisted `CIID <-> external ID` tables, one per adapter scope. External
/// IDs travel in their string form.
#[async_trait]
pub trait ScopeMapPersister: Storage {
    async fn load_scope(&self, scope: &str, tx: &mut Self::Tx) -> Result<HashMap<Ciid, String>>;
    /// Replaces the whole table of the scope.
    async fn persist_scope(
        &self,
        scope: &str,
        table: &HashMap<Ciid, String>,
        tx: &mut Self::Tx,
    ) -> Result<()>;
    async fn all_mapped_ciids(&self, tx: &mut Self::Tx) -> Result<HashSet<Ciid>>;
    /// Drops every scope not in `used`, returning how many were dropped.
    async fn delete_unused_scopes(&self, used: &HashSet<String>, tx: &mut Self::Tx) -> Result<usize>;
    /// The run lock of a scope. Every caller asking for the same scope gets
    /// the same mutex.
    fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>>;
}

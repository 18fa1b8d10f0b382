// used for persistence
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::str::FromStr;
use tokio::sync::{Mutex, OwnedMutexGuard};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use tracing::debug;

use crate::construct::{
    AnchorState, Attribute, AttributeState, Changeset, ChangesetId, CiSelection, Ciid, Layer,
    LayerId, NameSelection, Predicate, PredicateConstraints, Relation, RelationState,
    TimeThreshold,
};
use crate::datatype::AttributeValue;
use crate::error::{LayerkeeperError, Result};
use crate::storage::{validate_scope, ScopeMapPersister, Storage};

pub enum PersistenceMode {
    InMemory,
    File(String),
}

// The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
// debugging using an external tool like DBeaver impossible
const SCHEMA: &str = "
    create table if not exists CI (
        CI_Identity text not null,
        constraint unique_and_referenceable_CI_Identity primary key (
            CI_Identity
        )
    );-- STRICT;
    create table if not exists Layer (
        Layer_Identity text not null,
        Name text not null,
        constraint referenceable_Layer_Identity primary key (
            Layer_Identity
        )
    );-- STRICT;
    create table if not exists Changeset (
        Changeset_Identity text not null,
        User_Identity integer not null,
        Timestamp integer not null,
        constraint referenceable_Changeset_Identity primary key (
            Changeset_Identity
        )
    );-- STRICT;
    create table if not exists Attribute (
        Attribute_Identity text not null,
        Name text not null,
        CI_Identity text not null,
        Layer_Identity text not null,
        DataType text not null,
        IsArray integer not null,
        AttributeValue text not null,
        State integer not null,
        Changeset_Identity text not null,
        constraint Attribute_of_CI foreign key (
            CI_Identity
        ) references CI(CI_Identity),
        constraint Attribute_in_Layer foreign key (
            Layer_Identity
        ) references Layer(Layer_Identity),
        constraint Attribute_by_Changeset foreign key (
            Changeset_Identity
        ) references Changeset(Changeset_Identity),
        constraint referenceable_Attribute_Identity primary key (
            Attribute_Identity
        )
    );-- STRICT;
    create index if not exists Attribute_by_Layer on Attribute (
        Layer_Identity, Name, CI_Identity
    );
    create table if not exists Predicate (
        Predicate_Identity text not null,
        WordingFrom text not null,
        WordingTo text not null,
        AnchorState integer not null,
        Constraints text not null,
        constraint referenceable_Predicate_Identity primary key (
            Predicate_Identity
        )
    );-- STRICT;
    create table if not exists Relation (
        Relation_Identity text not null,
        From_CI_Identity text not null,
        To_CI_Identity text not null,
        Predicate_Identity text not null,
        Layer_Identity text not null,
        State integer not null,
        Changeset_Identity text not null,
        constraint Relation_from_CI foreign key (
            From_CI_Identity
        ) references CI(CI_Identity),
        constraint Relation_to_CI foreign key (
            To_CI_Identity
        ) references CI(CI_Identity),
        constraint Relation_in_Layer foreign key (
            Layer_Identity
        ) references Layer(Layer_Identity),
        constraint referenceable_Relation_Identity primary key (
            Relation_Identity
        )
    );-- STRICT;
    create index if not exists Relation_by_Layer on Relation (
        Layer_Identity, From_CI_Identity, To_CI_Identity, Predicate_Identity
    );
    create table if not exists ExternalIdMap (
        Scope text not null,
        CI_Identity text not null,
        ExternalId text not null,
        constraint referenceable_CI_in_Scope primary key (
            Scope,
            CI_Identity
        ),
        constraint unique_ExternalId_in_Scope unique (
            Scope,
            ExternalId
        )
    );-- STRICT;
";

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| LayerkeeperError::DataCorruption {
        message: format!("'{}' is not an identity: {}", text, e),
    })
}

fn to_micros(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| LayerkeeperError::DataCorruption {
        message: format!("{} is not a valid timestamp", micros),
    })
}

/// Changesets are stored with microsecond resolution, so the timestamp they
/// are issued with is cut to the same resolution.
fn truncate_to_micros(time: &DateTime<Utc>) -> Result<DateTime<Utc>> {
    from_micros(to_micros(time))
}

fn in_list(column: &str, count: usize) -> String {
    format!("{} in ({})", column, vec!["?"; count].join(", "))
}

fn threshold_micros(at: TimeThreshold) -> i64 {
    match at {
        TimeThreshold::Latest => i64::MAX,
        TimeThreshold::At(time) => to_micros(&time),
    }
}

fn state_identifier(raw: i64) -> Result<u8> {
    u8::try_from(raw).map_err(|_| LayerkeeperError::DataCorruption {
        message: format!("{} is not a state", raw),
    })
}

/// Keeps the latest version per key while remembering the order in which
/// keys first appeared.
struct LatestKeeper<K, F> {
    index: HashMap<K, usize>,
    kept: Vec<F>,
}
impl<K: Eq + std::hash::Hash, F> LatestKeeper<K, F> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            kept: Vec::new(),
        }
    }
    fn keep(&mut self, key: K, fact: F) {
        match self.index.get(&key) {
            Some(&i) => self.kept[i] = fact,
            None => {
                self.index.insert(key, self.kept.len());
                self.kept.push(fact);
            }
        }
    }
    fn into_kept(self) -> Vec<F> {
        self.kept
    }
}

// ------------- Persistence -------------
/// SQLite backed storage. A transaction holds the connection exclusively
/// until it is committed, rolled back or dropped.
pub struct Persistor {
    connection: Arc<Mutex<Connection>>,
    // run locks of reconciliation scopes, created on first request
    scope_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

pub struct SqliteTx {
    connection: OwnedMutexGuard<Connection>,
    open: bool,
}
impl SqliteTx {
    fn connection(&self) -> &Connection {
        &self.connection
    }
    fn finish(&mut self, statement: &str) -> Result<()> {
        self.connection.execute_batch(statement)?;
        self.open = false;
        Ok(())
    }
}
impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.connection.execute_batch("rollback") {
                debug!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

impl Persistor {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            scope_locks: StdMutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Storage for Persistor {
    type Tx = SqliteTx;

    async fn begin(&self) -> Result<SqliteTx> {
        let connection = Arc::clone(&self.connection).lock_owned().await;
        connection.execute_batch("begin immediate")?;
        Ok(SqliteTx {
            connection,
            open: true,
        })
    }

    async fn commit(&self, mut tx: SqliteTx) -> Result<()> {
        tx.finish("commit")
    }

    async fn rollback(&self, mut tx: SqliteTx) -> Result<()> {
        tx.finish("rollback")
    }

    async fn ci_exists(&self, ciid: Ciid, tx: &mut SqliteTx) -> Result<bool> {
        let found = tx
            .connection()
            .prepare_cached("select 1 from CI where CI_Identity = ?")?
            .query_row(params![&ciid], |r| r.get::<_, i64>(0))
            .optional()?;
        Ok(found.is_some())
    }

    async fn create_ci(&self, ciid: Ciid, tx: &mut SqliteTx) -> Result<()> {
        tx.connection()
            .prepare_cached("insert or ignore into CI (CI_Identity) values (?)")?
            .execute(params![&ciid])?;
        Ok(())
    }

    async fn delete_ci(&self, ciid: Ciid, tx: &mut SqliteTx) -> Result<bool> {
        let connection = tx.connection();
        connection
            .prepare_cached("delete from Attribute where CI_Identity = ?")?
            .execute(params![&ciid])?;
        connection
            .prepare_cached("delete from Relation where From_CI_Identity = ?1 or To_CI_Identity = ?1")?
            .execute(params![&ciid])?;
        let deleted = connection
            .prepare_cached("delete from CI where CI_Identity = ?")?
            .execute(params![&ciid])?;
        Ok(deleted > 0)
    }

    async fn ciids(&self, tx: &mut SqliteTx) -> Result<Vec<Ciid>> {
        let mut statement = tx
            .connection()
            .prepare_cached("select CI_Identity from CI order by rowid")?;
        let ciids = statement
            .query_map([], |row| row.get::<_, Ciid>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ciids)
    }

    async fn create_layer(&self, layer: &Layer, tx: &mut SqliteTx) -> Result<bool> {
        let inserted = tx
            .connection()
            .prepare_cached("insert or ignore into Layer (Layer_Identity, Name) values (?, ?)")?
            .execute(params![layer.id(), layer.name()])?;
        Ok(inserted > 0)
    }

    async fn layers(&self, tx: &mut SqliteTx) -> Result<Vec<Layer>> {
        let mut statement = tx
            .connection()
            .prepare_cached("select Layer_Identity, Name from Layer order by rowid")?;
        let layers = statement
            .query_map([], |row| Ok(Layer::new(row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(layers)
    }

    async fn upsert_predicate(&self, predicate: &Predicate, tx: &mut SqliteTx) -> Result<()> {
        let constraints = serde_json::to_string(predicate.constraints())?;
        tx.connection()
            .prepare_cached(
                "
                insert into Predicate (
                    Predicate_Identity,
                    WordingFrom,
                    WordingTo,
                    AnchorState,
                    Constraints
                ) values (?1, ?2, ?3, ?4, ?5)
                on conflict (Predicate_Identity) do update set
                    WordingFrom = excluded.WordingFrom,
                    WordingTo = excluded.WordingTo,
                    AnchorState = excluded.AnchorState,
                    Constraints = excluded.Constraints
            ",
            )?
            .execute(params![
                predicate.id(),
                predicate.wording_from(),
                predicate.wording_to(),
                predicate.anchor_state().identifier(),
                constraints
            ])?;
        Ok(())
    }

    async fn predicates(&self, tx: &mut SqliteTx) -> Result<Vec<Predicate>> {
        let mut statement = tx.connection().prepare_cached(
            "
            select Predicate_Identity, WordingFrom, WordingTo, AnchorState, Constraints
                from Predicate
                order by Predicate_Identity
        ",
        )?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut predicates = Vec::with_capacity(rows.len());
        for (id, wording_from, wording_to, anchor_state, constraints) in rows {
            let constraints: PredicateConstraints = serde_json::from_str(&constraints)?;
            predicates.push(Predicate::new(
                id,
                wording_from,
                wording_to,
                AnchorState::from_identifier(state_identifier(anchor_state)?)?,
                constraints,
            ));
        }
        Ok(predicates)
    }

    async fn create_changeset(
        &self,
        user_id: i64,
        timestamp: DateTime<Utc>,
        tx: &mut SqliteTx,
    ) -> Result<Changeset> {
        let changeset = Changeset::new(Uuid::new_v4(), user_id, truncate_to_micros(&timestamp)?);
        tx.connection()
            .prepare_cached(
                "
                insert into Changeset (
                    Changeset_Identity,
                    User_Identity,
                    Timestamp
                ) values (?, ?, ?)
            ",
            )?
            .execute(params![
                changeset.id().to_string(),
                user_id,
                to_micros(changeset.timestamp())
            ])?;
        Ok(changeset)
    }

    async fn changeset(&self, id: ChangesetId, tx: &mut SqliteTx) -> Result<Option<Changeset>> {
        let row = tx
            .connection()
            .prepare_cached(
                "select User_Identity, Timestamp from Changeset where Changeset_Identity = ?",
            )?
            .query_row(params![id.to_string()], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
            })
            .optional()?;
        match row {
            Some((user_id, micros)) => Ok(Some(Changeset::new(id, user_id, from_micros(micros)?))),
            None => Ok(None),
        }
    }

    async fn latest_attributes(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        names: &NameSelection,
        at: TimeThreshold,
        tx: &mut SqliteTx,
    ) -> Result<Vec<Attribute>> {
        let threshold = threshold_micros(at);
        let mut sql = String::from(
            "
            select a.Attribute_Identity,
                    a.Name,
                    a.CI_Identity,
                    a.DataType,
                    a.IsArray,
                    a.AttributeValue,
                    a.State,
                    a.Changeset_Identity
                from Attribute a
                join Changeset c
                on c.Changeset_Identity = a.Changeset_Identity
                where a.Layer_Identity = ?
                and c.Timestamp <= ?
        ",
        );
        let mut parameters: Vec<&dyn ToSql> = Vec::new();
        parameters.push(layer);
        parameters.push(&threshold);
        if let NameSelection::Specific(names) = names {
            sql.push_str(&format!(" and {}", in_list("a.Name", names.len())));
            parameters.extend(names.iter().map(|name| name as &dyn ToSql));
        }
        if let CiSelection::Specific(ciids) = selection {
            sql.push_str(&format!(" and {}", in_list("a.CI_Identity", ciids.len())));
            parameters.extend(ciids.iter().map(|ciid| ciid as &dyn ToSql));
        }
        sql.push_str(" order by c.Timestamp, a.rowid");

        let mut statement = tx.connection().prepare_cached(&sql)?;
        let rows = statement
            .query_map(&parameters[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut keeper = LatestKeeper::new();
        for (id, name, ciid, data_type, is_array, value, state, changeset) in rows {
            let attribute = Attribute::new(
                parse_uuid(&id)?,
                name,
                Ciid::from_str(&ciid)?,
                AttributeValue::unmarshal(&data_type, is_array, &value)?,
                AttributeState::from_identifier(state_identifier(state)?)?,
                parse_uuid(&changeset)?,
            );
            keeper.keep(attribute.key(), attribute);
        }
        Ok(keeper.into_kept())
    }

    async fn latest_relations(
        &self,
        layer: &LayerId,
        selection: &CiSelection,
        at: TimeThreshold,
        tx: &mut SqliteTx,
    ) -> Result<Vec<Relation>> {
        let threshold = threshold_micros(at);
        let mut sql = String::from(
            "
            select r.Relation_Identity,
                    r.From_CI_Identity,
                    r.To_CI_Identity,
                    r.Predicate_Identity,
                    r.State,
                    r.Changeset_Identity
                from Relation r
                join Changeset c
                on c.Changeset_Identity = r.Changeset_Identity
                where r.Layer_Identity = ?
                and c.Timestamp <= ?
        ",
        );
        let mut parameters: Vec<&dyn ToSql> = Vec::new();
        parameters.push(layer);
        parameters.push(&threshold);
        if let CiSelection::Specific(ciids) = selection {
            // either endpoint selects the relation
            sql.push_str(&format!(
                " and ({} or {})",
                in_list("r.From_CI_Identity", ciids.len()),
                in_list("r.To_CI_Identity", ciids.len())
            ));
            parameters.extend(ciids.iter().map(|ciid| ciid as &dyn ToSql));
            parameters.extend(ciids.iter().map(|ciid| ciid as &dyn ToSql));
        }
        sql.push_str(" order by c.Timestamp, r.rowid");

        let mut statement = tx.connection().prepare_cached(&sql)?;
        let rows = statement
            .query_map(&parameters[..], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut keeper = LatestKeeper::new();
        for (id, from, to, predicate_id, state, changeset) in rows {
            let relation = Relation::new(
                parse_uuid(&id)?,
                Ciid::from_str(&from)?,
                Ciid::from_str(&to)?,
                predicate_id,
                RelationState::from_identifier(state_identifier(state)?)?,
                parse_uuid(&changeset)?,
            );
            keeper.keep(relation.key(), relation);
        }
        Ok(keeper.into_kept())
    }

    async fn write_attribute(
        &self,
        layer: &LayerId,
        name: &str,
        ciid: Ciid,
        value: &AttributeValue,
        state: AttributeState,
        changeset: &Changeset,
        tx: &mut SqliteTx,
    ) -> Result<Attribute> {
        let id = Uuid::new_v4();
        let (data_type, is_array, text) = value.marshal()?;
        tx.connection()
            .prepare_cached(
                "
                insert into Attribute (
                    Attribute_Identity,
                    Name,
                    CI_Identity,
                    Layer_Identity,
                    DataType,
                    IsArray,
                    AttributeValue,
                    State,
                    Changeset_Identity
                ) values (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            )?
            .execute(params![
                id.to_string(),
                name,
                &ciid,
                layer,
                data_type,
                is_array,
                text,
                state.identifier(),
                changeset.id().to_string()
            ])?;
        Ok(Attribute::new(
            id,
            name.to_owned(),
            ciid,
            value.clone(),
            state,
            changeset.id(),
        ))
    }

    async fn write_relation(
        &self,
        layer: &LayerId,
        from: Ciid,
        to: Ciid,
        predicate_id: &str,
        state: RelationState,
        changeset: &Changeset,
        tx: &mut SqliteTx,
    ) -> Result<Relation> {
        let id = Uuid::new_v4();
        tx.connection()
            .prepare_cached(
                "
                insert into Relation (
                    Relation_Identity,
                    From_CI_Identity,
                    To_CI_Identity,
                    Predicate_Identity,
                    Layer_Identity,
                    State,
                    Changeset_Identity
                ) values (?, ?, ?, ?, ?, ?, ?)
            ",
            )?
            .execute(params![
                id.to_string(),
                &from,
                &to,
                predicate_id,
                layer,
                state.identifier(),
                changeset.id().to_string()
            ])?;
        Ok(Relation::new(
            id,
            from,
            to,
            predicate_id.to_owned(),
            state,
            changeset.id(),
        ))
    }
}

#[async_trait]
impl ScopeMapPersister for Persistor {
    async fn load_scope(&self, scope: &str, tx: &mut SqliteTx) -> Result<HashMap<Ciid, String>> {
        validate_scope(scope)?;
        let mut statement = tx
            .connection()
            .prepare_cached("select CI_Identity, ExternalId from ExternalIdMap where Scope = ?")?;
        let table = statement
            .query_map(params![scope], |row| {
                Ok((row.get::<_, Ciid>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(table)
    }

    async fn persist_scope(
        &self,
        scope: &str,
        table: &HashMap<Ciid, String>,
        tx: &mut SqliteTx,
    ) -> Result<()> {
        validate_scope(scope)?;
        let connection = tx.connection();
        // truncate and write everything anew
        connection
            .prepare_cached("delete from ExternalIdMap where Scope = ?")?
            .execute(params![scope])?;
        let mut insert = connection.prepare_cached(
            "insert into ExternalIdMap (Scope, CI_Identity, ExternalId) values (?, ?, ?)",
        )?;
        for (ciid, external_id) in table {
            insert.execute(params![scope, ciid, external_id])?;
        }
        Ok(())
    }

    async fn all_mapped_ciids(&self, tx: &mut SqliteTx) -> Result<HashSet<Ciid>> {
        let mut statement = tx
            .connection()
            .prepare_cached("select distinct CI_Identity from ExternalIdMap")?;
        let ciids = statement
            .query_map([], |row| row.get::<_, Ciid>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ciids)
    }

    async fn delete_unused_scopes(&self, used: &HashSet<String>, tx: &mut SqliteTx) -> Result<usize> {
        let connection = tx.connection();
        let scopes = connection
            .prepare_cached("select distinct Scope from ExternalIdMap")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut deleted = 0;
        for scope in scopes.iter().filter(|s| !used.contains(*s)) {
            connection
                .prepare_cached("delete from ExternalIdMap where Scope = ?")?
                .execute(params![scope])?;
            deleted += 1;
        }
        Ok(deleted)
    }

    fn scope_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .scope_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(scope.to_owned()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(id: &str) -> Layer {
        Layer::new(LayerId::from(id), id.to_uppercase())
    }

    #[tokio::test]
    async fn latest_version_per_key_respects_threshold() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        persistor.create_layer(&layer("l1"), &mut tx).await.unwrap();
        let ciid = Ciid::generate();
        persistor.create_ci(ciid, &mut tx).await.unwrap();

        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let c0 = persistor.create_changeset(1, t0, &mut tx).await.unwrap();
        let c1 = persistor.create_changeset(1, t1, &mut tx).await.unwrap();
        let l1 = LayerId::from("l1");
        persistor
            .write_attribute(&l1, "name", ciid, &"old".into(), AttributeState::New, &c0, &mut tx)
            .await
            .unwrap();
        persistor
            .write_attribute(&l1, "name", ciid, &"new".into(), AttributeState::Changed, &c1, &mut tx)
            .await
            .unwrap();

        let all = CiSelection::All;
        let names = NameSelection::All;
        let latest = persistor
            .latest_attributes(&l1, &all, &names, TimeThreshold::Latest, &mut tx)
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value(), &AttributeValue::text("new"));

        let past = persistor
            .latest_attributes(&l1, &all, &names, TimeThreshold::at(t0), &mut tx)
            .await
            .unwrap();
        assert_eq!(past[0].value(), &AttributeValue::text("old"));
        persistor.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transactions_roll_back() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let ciid = Ciid::generate();
        {
            let mut tx = persistor.begin().await.unwrap();
            persistor.create_ci(ciid, &mut tx).await.unwrap();
        }
        let mut tx = persistor.begin().await.unwrap();
        assert!(!persistor.ci_exists(ciid, &mut tx).await.unwrap());
        persistor.rollback(tx).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_values_surface_as_corruption() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        let ciid = Ciid::generate();
        persistor.create_ci(ciid, &mut tx).await.unwrap();
        let changeset = persistor.create_changeset(1, Utc::now(), &mut tx).await.unwrap();
        let l1 = LayerId::from("l1");
        persistor
            .write_attribute(&l1, "size", ciid, &AttributeValue::integer(3), AttributeState::New, &changeset, &mut tx)
            .await
            .unwrap();
        tx.connection()
            .execute("update Attribute set AttributeValue = 'three'", [])
            .unwrap();
        let result = persistor
            .latest_attributes(&l1, &CiSelection::All, &NameSelection::All, TimeThreshold::Latest, &mut tx)
            .await;
        assert!(matches!(result, Err(LayerkeeperError::DataCorruption { .. })));
    }

    #[tokio::test]
    async fn selections_only_read_matching_rows() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        let (good, other) = (Ciid::generate(), Ciid::generate());
        persistor.create_ci(good, &mut tx).await.unwrap();
        persistor.create_ci(other, &mut tx).await.unwrap();
        let changeset = persistor.create_changeset(1, Utc::now(), &mut tx).await.unwrap();
        let l1 = LayerId::from("l1");
        for (ciid, name) in [(good, "size"), (good, "color"), (other, "size")] {
            persistor
                .write_attribute(&l1, name, ciid, &AttributeValue::integer(3), AttributeState::New, &changeset, &mut tx)
                .await
                .unwrap();
        }
        tx.connection()
            .execute(
                "update Attribute set AttributeValue = 'three' where CI_Identity = ?",
                params![other],
            )
            .unwrap();

        let scoped = persistor
            .latest_attributes(
                &l1,
                &CiSelection::specific([good]),
                &NameSelection::specific(["size"]),
                TimeThreshold::Latest,
                &mut tx,
            )
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].key(), ("size".to_string(), good));

        let unscoped = persistor
            .latest_attributes(&l1, &CiSelection::All, &NameSelection::All, TimeThreshold::Latest, &mut tx)
            .await;
        assert!(matches!(unscoped, Err(LayerkeeperError::DataCorruption { .. })));
        assert!(persistor
            .latest_attributes(&l1, &CiSelection::specific(Vec::<Ciid>::new()), &NameSelection::All, TimeThreshold::Latest, &mut tx)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn relation_selection_matches_either_endpoint() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        let (a, b, c) = (Ciid::generate(), Ciid::generate(), Ciid::generate());
        let changeset = persistor.create_changeset(1, Utc::now(), &mut tx).await.unwrap();
        let l1 = LayerId::from("l1");
        for (from, to) in [(a, b), (b, c)] {
            persistor
                .write_relation(&l1, from, to, "runs_on", RelationState::New, &changeset, &mut tx)
                .await
                .unwrap();
        }
        let touching_a = persistor
            .latest_relations(&l1, &CiSelection::specific([a]), TimeThreshold::Latest, &mut tx)
            .await
            .unwrap();
        assert_eq!(touching_a.len(), 1);
        let touching_b = persistor
            .latest_relations(&l1, &CiSelection::specific([b]), TimeThreshold::Latest, &mut tx)
            .await
            .unwrap();
        assert_eq!(touching_b.len(), 2);
    }

    #[tokio::test]
    async fn changeset_timestamps_are_cut_to_microseconds() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let ciid = Ciid::generate();
        persistor.create_ci(ciid, &mut tx).await.unwrap();
        let changeset = persistor
            .create_changeset(1, base + chrono::Duration::nanoseconds(1_500), &mut tx)
            .await
            .unwrap();
        assert_eq!(changeset.timestamp(), &(base + chrono::Duration::microseconds(1)));
        let stored = persistor.changeset(changeset.id(), &mut tx).await.unwrap().unwrap();
        assert_eq!(stored.timestamp(), changeset.timestamp());

        let l1 = LayerId::from("l1");
        persistor
            .write_attribute(&l1, "size", ciid, &AttributeValue::integer(1), AttributeState::New, &changeset, &mut tx)
            .await
            .unwrap();
        for nanos in [999, 1_000, 1_200, 2_000] {
            let threshold = base + chrono::Duration::nanoseconds(nanos);
            let visible = persistor
                .latest_attributes(&l1, &CiSelection::All, &NameSelection::All, TimeThreshold::at(threshold), &mut tx)
                .await
                .unwrap();
            assert_eq!(!visible.is_empty(), changeset.timestamp() <= &threshold, "at +{}ns", nanos);
        }
    }

    #[test]
    fn scope_locks_are_shared_per_scope() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let first = persistor.scope_lock("inventory");
        assert!(Arc::ptr_eq(&first, &persistor.scope_lock("inventory")));
        assert!(!Arc::ptr_eq(&first, &persistor.scope_lock("directory")));
    }

    #[tokio::test]
    async fn scope_tables_are_replaced_and_isolated() {
        let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
        let mut tx = persistor.begin().await.unwrap();
        let (a, b) = (Ciid::generate(), Ciid::generate());
        let first: HashMap<Ciid, String> = [(a, "eid-a".to_string()), (b, "eid-b".to_string())].into();
        persistor.persist_scope("inventory", &first, &mut tx).await.unwrap();
        persistor.persist_scope("directory", &HashMap::from([(a, "uid=a".to_string())]), &mut tx).await.unwrap();
        let second: HashMap<Ciid, String> = [(b, "eid-b".to_string())].into();
        persistor.persist_scope("inventory", &second, &mut tx).await.unwrap();

        assert_eq!(persistor.load_scope("inventory", &mut tx).await.unwrap(), second);
        assert_eq!(persistor.load_scope("directory", &mut tx).await.unwrap().len(), 1);
        assert_eq!(persistor.all_mapped_ciids(&mut tx).await.unwrap(), HashSet::from([a, b]));

        let used = HashSet::from(["inventory".to_string()]);
        assert_eq!(persistor.delete_unused_scopes(&used, &mut tx).await.unwrap(), 1);
        assert!(persistor.load_scope("directory", &mut tx).await.unwrap().is_empty());
        assert!(persistor.load_scope("drop table", &mut tx).await.is_err());
    }
}

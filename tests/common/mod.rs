#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};

use layerkeeper::construct::{
    AttributeState, Ciid, LayerId, Predicate, PredicateConstraints, AnchorState, RelationState,
};
use layerkeeper::datatype::AttributeValue;
use layerkeeper::persist::{PersistenceMode, Persistor};
use layerkeeper::storage::Storage;

pub fn store() -> Persistor {
    Persistor::new(PersistenceMode::InMemory).expect("in-memory store")
}

/// Seconds after a fixed epoch, so tests never depend on the clock.
pub fn t(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds)
}

pub async fn create_ci(store: &Persistor) -> Ciid {
    let ciid = Ciid::generate();
    let mut tx = store.begin().await.unwrap();
    store.create_ci(ciid, &mut tx).await.unwrap();
    store.commit(tx).await.unwrap();
    ciid
}

pub async fn ci_count(store: &Persistor) -> usize {
    let mut tx = store.begin().await.unwrap();
    let count = store.ciids(&mut tx).await.unwrap().len();
    store.rollback(tx).await.unwrap();
    count
}

pub async fn ci_exists(store: &Persistor, ciid: Ciid) -> bool {
    let mut tx = store.begin().await.unwrap();
    let exists = store.ci_exists(ciid, &mut tx).await.unwrap();
    store.rollback(tx).await.unwrap();
    exists
}

pub async fn delete_ci(store: &Persistor, ciid: Ciid) {
    let mut tx = store.begin().await.unwrap();
    assert!(store.delete_ci(ciid, &mut tx).await.unwrap());
    store.commit(tx).await.unwrap();
}

/// Writes one attribute version in its own changeset at `at`.
pub async fn put(
    store: &Persistor,
    layer: &str,
    ciid: Ciid,
    name: &str,
    value: impl Into<AttributeValue>,
    state: AttributeState,
    at: DateTime<Utc>,
) {
    let mut tx = store.begin().await.unwrap();
    let changeset = store.create_changeset(1, at, &mut tx).await.unwrap();
    store
        .write_attribute(&LayerId::from(layer), name, ciid, &value.into(), state, &changeset, &mut tx)
        .await
        .unwrap();
    store.commit(tx).await.unwrap();
}

pub async fn relate(
    store: &Persistor,
    layer: &str,
    from: Ciid,
    to: Ciid,
    predicate_id: &str,
    state: RelationState,
    at: DateTime<Utc>,
) {
    let mut tx = store.begin().await.unwrap();
    let changeset = store.create_changeset(1, at, &mut tx).await.unwrap();
    store
        .write_relation(&LayerId::from(layer), from, to, predicate_id, state, &changeset, &mut tx)
        .await
        .unwrap();
    store.commit(tx).await.unwrap();
}

pub async fn predicate(store: &Persistor, id: &str) {
    let mut tx = store.begin().await.unwrap();
    let predicate = Predicate::new(
        id.to_owned(),
        format!("{} to", id),
        format!("{} from", id),
        AnchorState::Active,
        PredicateConstraints::default(),
    );
    store.upsert_predicate(&predicate, &mut tx).await.unwrap();
    store.commit(tx).await.unwrap();
}

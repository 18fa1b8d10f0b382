//! The layer merge engine.
//!
//! A merged view is computed by fetching, for each layer of a [`LayerSet`] in
//! order, the live version of every fact visible at the time threshold and
//! folding those left to right. A live version in a later layer replaces the
//! current winner and its layer is appended to the provenance stack. A layer
//! without a live version for a key leaves that key alone, so absence in a
//! higher layer never hides what a lower layer says.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::construct::{
    Attribute, CiSelection, Ciid, LayerId, LayerSet, MergedCiAttribute, MergedRelation,
    NameSelection, Relation, RelationKey, TimeThreshold,
};
use crate::error::Result;
use crate::storage::Storage;

/// Folds per-layer facts into one winner per key, keeping every contributing
/// layer in stack order. Keys come out in the order they were first seen.
pub fn fold_layers<'l, F, K, I, KF>(per_layer: I, key_of: KF) -> Vec<(F, Vec<LayerId>)>
where
    I: IntoIterator<Item = (&'l LayerId, Vec<F>)>,
    K: Eq + Hash,
    KF: Fn(&F) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut merged: Vec<(F, Vec<LayerId>)> = Vec::new();
    for (layer, facts) in per_layer {
        for fact in facts {
            let key = key_of(&fact);
            match index.get(&key) {
                Some(&i) => {
                    let (winner, stack) = &mut merged[i];
                    *winner = fact;
                    stack.push(layer.clone());
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push((fact, vec![layer.clone()]));
                }
            }
        }
    }
    merged
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RelationDirection {
    Outgoing,
    Incoming,
}

pub struct MergeEngine<'s, S: Storage> {
    storage: &'s S,
}

impl<'s, S: Storage> MergeEngine<'s, S> {
    pub fn new(storage: &'s S) -> Self {
        Self { storage }
    }

    async fn fold_attributes(
        &self,
        selection: &CiSelection,
        names: &NameSelection,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<Vec<MergedCiAttribute>> {
        let mut per_layer = Vec::with_capacity(layer_set.len());
        for layer in layer_set.iter() {
            let live = self
                .storage
                .live_attributes(layer, selection, names, at, tx)
                .await?;
            per_layer.push((layer, live));
        }
        let merged: Vec<MergedCiAttribute> = fold_layers(per_layer, Attribute::key)
            .into_iter()
            .map(|(attribute, stack)| MergedCiAttribute::new(attribute, stack))
            .collect();
        debug!(layer_set = %layer_set, at = %at, attributes = merged.len(), "merged attributes");
        Ok(merged)
    }

    async fn fold_relations(
        &self,
        selection: &CiSelection,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<Vec<MergedRelation>> {
        let mut per_layer = Vec::with_capacity(layer_set.len());
        for layer in layer_set.iter() {
            let live = self.storage.live_relations(layer, selection, at, tx).await?;
            per_layer.push((layer, live));
        }
        let merged: Vec<MergedRelation> = fold_layers(per_layer, Relation::key)
            .into_iter()
            .map(|(relation, stack)| MergedRelation::new(relation, stack))
            .collect();
        debug!(layer_set = %layer_set, at = %at, relations = merged.len(), "merged relations");
        Ok(merged)
    }

    /// Merged attributes grouped by CI and then by attribute name.
    pub async fn merged_attributes(
        &self,
        selection: &CiSelection,
        names: &NameSelection,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<HashMap<Ciid, HashMap<String, MergedCiAttribute>>> {
        let mut by_ci: HashMap<Ciid, HashMap<String, MergedCiAttribute>> = HashMap::new();
        for merged in self.fold_attributes(selection, names, layer_set, at, tx).await? {
            let attribute = merged.attribute();
            by_ci
                .entry(attribute.ciid())
                .or_default()
                .insert(attribute.name().to_owned(), merged);
        }
        Ok(by_ci)
    }

    pub async fn merged_attribute(
        &self,
        name: &str,
        ciid: Ciid,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<Option<MergedCiAttribute>> {
        let selection = CiSelection::specific([ciid]);
        let names = NameSelection::specific([name]);
        let mut merged = self
            .fold_attributes(&selection, &names, layer_set, at, tx)
            .await?;
        Ok(merged.pop())
    }

    /// Every merged attribute with the given name, in fold order.
    pub async fn merged_attributes_by_name(
        &self,
        name: &str,
        selection: &CiSelection,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<Vec<MergedCiAttribute>> {
        let names = NameSelection::specific([name]);
        self.fold_attributes(selection, &names, layer_set, at, tx).await
    }

    pub async fn merged_relations(
        &self,
        selection: &CiSelection,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<HashMap<RelationKey, MergedRelation>> {
        let merged = self.fold_relations(selection, layer_set, at, tx).await?;
        Ok(merged
            .into_iter()
            .map(|m| (m.relation().key(), m))
            .collect())
    }

    /// Merged relations touching one CI, optionally narrowed to a predicate.
    pub async fn merged_relations_of(
        &self,
        ciid: Ciid,
        direction: RelationDirection,
        predicate_id: Option<&str>,
        layer_set: &LayerSet,
        at: TimeThreshold,
        tx: &mut S::Tx,
    ) -> Result<Vec<MergedRelation>> {
        let selection = CiSelection::specific([ciid]);
        let mut merged = self.fold_relations(&selection, layer_set, at, tx).await?;
        merged.retain(|m| {
            let relation = m.relation();
            let endpoint = match direction {
                RelationDirection::Outgoing => relation.from(),
                RelationDirection::Incoming => relation.to(),
            };
            endpoint == ciid && predicate_id.is_none_or(|p| relation.predicate_id() == p)
        });
        Ok(merged)
    }
}

//! CI identification: turning an identification method into CIIDs.
//!
//! Resolution never creates CIs. It only reports which existing (or
//! explicitly named) CIs a candidate refers to; callers decide what to do
//! with an empty answer.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::warn;

use crate::construct::{CiSelection, Ciid, LayerSet, Lookup, OtherHasher, TimeThreshold};
use crate::datatype::AttributeValue;
use crate::error::{LayerkeeperError, Result};
use crate::merge::MergeEngine;
use crate::storage::Storage;

// ------------- Fragments -------------
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Fragment {
    name: String,
    value: AttributeValue,
}
impl Fragment {
    pub fn new(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn value(&self) -> &AttributeValue {
        &self.value
    }
}
impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// The attributes a candidate brings along.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CiCandidateAttributeData {
    fragments: Vec<Fragment>,
}
impl CiCandidateAttributeData {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }
    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.name == name)
    }
    pub fn concat(mut self, other: CiCandidateAttributeData) -> Self {
        self.fragments.extend(other.fragments);
        self
    }
    pub fn into_fragments(self) -> Vec<Fragment> {
        self.fragments
    }
}

// ------------- Identification methods -------------
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum IdentificationMethod {
    /// Match existing CIs whose merged attributes in `search_layers` equal
    /// every fragment.
    ByData {
        fragments: Vec<Fragment>,
        search_layers: LayerSet,
    },
    /// Refers to another candidate of the same batch.
    ByTemporaryCiid(Ciid),
    ByCiid(Ciid),
    Noop,
}

impl IdentificationMethod {
    /// Builds a `ByData` method from the named attributes of a candidate.
    pub fn by_data_from_attributes(
        names: &[&str],
        attributes: &CiCandidateAttributeData,
        search_layers: LayerSet,
    ) -> Result<Self> {
        let fragments = names
            .iter()
            .map(|name| {
                attributes.fragment(name).cloned().ok_or_else(|| {
                    LayerkeeperError::Invariant(format!(
                        "identifying attribute '{}' is not among the candidate attributes",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::ByData {
            fragments,
            search_layers,
        })
    }
}

impl fmt::Display for IdentificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ByData {
                fragments,
                search_layers,
            } => {
                let fragments: Vec<String> = fragments.iter().map(Fragment::to_string).collect();
                write!(f, "by data {{{}}} in {}", fragments.join(", "), search_layers)
            }
            Self::ByTemporaryCiid(temporary) => write!(f, "by temporary CIID {}", temporary),
            Self::ByCiid(ciid) => write!(f, "by CIID {}", ciid),
            Self::Noop => write!(f, "noop"),
        }
    }
}

// ------------- Mapping context -------------
/// Per-batch memo of attribute value lookups and of the temporary to final
/// CIID table. Create one when a batch starts and drop it with the batch.
pub struct MappingContext {
    at: TimeThreshold,
    values: HashMap<(LayerSet, String), Lookup<AttributeValue, Ciid, OtherHasher>>,
    temporary: HashMap<Ciid, Ciid>,
}

impl MappingContext {
    pub fn new(at: TimeThreshold) -> Self {
        Self {
            at,
            values: HashMap::new(),
            temporary: HashMap::new(),
        }
    }

    pub fn at(&self) -> TimeThreshold {
        self.at
    }

    pub fn add_temporary(&mut self, temporary: Ciid, final_ciid: Ciid) -> Result<()> {
        if self.temporary.contains_key(&temporary) {
            return Err(LayerkeeperError::Invariant(format!(
                "temporary CIID {} is used by more than one candidate",
                temporary
            )));
        }
        self.temporary.insert(temporary, final_ciid);
        Ok(())
    }

    pub fn temporary(&self, temporary: &Ciid) -> Option<Ciid> {
        self.temporary.get(temporary).copied()
    }

    pub fn temporary_mappings(&self) -> &HashMap<Ciid, Ciid> {
        &self.temporary
    }

    /// CIIDs whose merged attribute `name` equals `value`. The first call per
    /// name and layer set runs one merge query; later calls hit the memo.
    pub async fn ciids_with<S: Storage>(
        &mut self,
        merge: &MergeEngine<'_, S>,
        name: &str,
        value: &AttributeValue,
        search_layers: &LayerSet,
        tx: &mut S::Tx,
    ) -> Result<Vec<Ciid>> {
        let key = (search_layers.clone(), name.to_owned());
        if !self.values.contains_key(&key) {
            let merged = merge
                .merged_attributes_by_name(name, &CiSelection::All, search_layers, self.at, tx)
                .await?;
            let mut lookup = Lookup::new();
            for m in merged {
                let attribute = m.attribute();
                lookup.insert(attribute.value().clone(), attribute.ciid());
            }
            self.values.insert(key.clone(), lookup);
        }
        Ok(self
            .values
            .get(&key)
            .map(|lookup| lookup.lookup(value).to_vec())
            .unwrap_or_default())
    }
}

impl Default for MappingContext {
    fn default() -> Self {
        Self::new(TimeThreshold::Latest)
    }
}

// ------------- Identification service -------------
pub struct IdentificationService<'s, S: Storage> {
    merge: MergeEngine<'s, S>,
}

impl<'s, S: Storage> IdentificationService<'s, S> {
    pub fn new(storage: &'s S) -> Self {
        Self {
            merge: MergeEngine::new(storage),
        }
    }

    /// Every CIID the method points at, in a deterministic order.
    pub async fn try_to_match(
        &self,
        candidate: &str,
        method: &IdentificationMethod,
        context: &mut MappingContext,
        tx: &mut S::Tx,
    ) -> Result<Vec<Ciid>> {
        match method {
            IdentificationMethod::ByData {
                fragments,
                search_layers,
            } => {
                let mut matches: Option<Vec<Ciid>> = None;
                for fragment in fragments {
                    let found = context
                        .ciids_with(&self.merge, fragment.name(), fragment.value(), search_layers, tx)
                        .await?;
                    let narrowed = match matches {
                        None => found,
                        Some(mut current) => {
                            let found: HashSet<Ciid> = found.into_iter().collect();
                            current.retain(|ciid| found.contains(ciid));
                            current
                        }
                    };
                    if narrowed.is_empty() {
                        return Ok(narrowed);
                    }
                    matches = Some(narrowed);
                }
                Ok(matches.unwrap_or_default())
            }
            IdentificationMethod::ByTemporaryCiid(temporary) => match context.temporary(temporary) {
                Some(ciid) => Ok(vec![ciid]),
                None => Err(LayerkeeperError::UnresolvedTemporaryCiid {
                    candidate: candidate.to_owned(),
                    temporary: *temporary,
                }),
            },
            IdentificationMethod::ByCiid(ciid) => Ok(vec![*ciid]),
            IdentificationMethod::Noop => Ok(vec![]),
        }
    }

    /// The single CIID the method resolves to. Several matches resolve to
    /// the first one.
    pub async fn resolve(
        &self,
        candidate: &str,
        method: &IdentificationMethod,
        context: &mut MappingContext,
        tx: &mut S::Tx,
    ) -> Result<Option<Ciid>> {
        let matches = self.try_to_match(candidate, method, context, tx).await?;
        if matches.len() > 1 {
            // first match in fold order wins; stable across runs over the same data
            warn!(
                candidate,
                method = %method,
                matches = matches.len(),
                chosen = %matches[0],
                "ambiguous identification, using first match"
            );
        }
        Ok(matches.first().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn by_data_needs_every_named_attribute() {
        let attributes = CiCandidateAttributeData::new(vec![
            Fragment::new("hostname", "web-01"),
            Fragment::new("os", "linux"),
        ]);
        let layers = LayerSet::from_ids(["inventory"]);
        let method =
            IdentificationMethod::by_data_from_attributes(&["hostname"], &attributes, layers.clone())
                .unwrap();
        assert_eq!(
            method,
            IdentificationMethod::ByData {
                fragments: vec![Fragment::new("hostname", "web-01")],
                search_layers: layers.clone(),
            }
        );
        assert!(
            IdentificationMethod::by_data_from_attributes(&["serial"], &attributes, layers).is_err()
        );
    }

    #[test]
    fn temporary_ids_are_unique_per_batch() {
        let mut context = MappingContext::default();
        let (temporary, first, second) = (Ciid::generate(), Ciid::generate(), Ciid::generate());
        context.add_temporary(temporary, first).unwrap();
        assert!(context.add_temporary(temporary, second).is_err());
        assert_eq!(context.temporary(&temporary), Some(first));
    }
}

//! Batch ingest of CI and relation candidates into one layer.
//!
//! Every candidate is resolved to a final CIID first, in batch order, so
//! relation candidates and later CI candidates can refer to earlier ones by
//! temporary CIID. The resolved data then replaces the layer's content: facts
//! that are sent again keep their version when the value is equal, new or
//! different values get a new version, and facts of the layer that were not
//! sent are marked removed. All writes share one changeset and one
//! transaction; any failure rolls the whole batch back.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::construct::{
    AttributeState, Changeset, ChangesetId, CiSelection, Ciid, LayerId, NameSelection,
    RelationKey, RelationState, TimeThreshold,
};
use crate::datatype::AttributeValue;
use crate::error::{LayerkeeperError, Result};
use crate::identify::{
    CiCandidateAttributeData, Fragment, IdentificationMethod, IdentificationService,
    MappingContext,
};
use crate::storage::Storage;

#[derive(Clone, Debug)]
pub struct CiCandidate {
    identification: IdentificationMethod,
    attributes: CiCandidateAttributeData,
}
impl CiCandidate {
    pub fn new(identification: IdentificationMethod, attributes: CiCandidateAttributeData) -> Self {
        Self {
            identification,
            attributes,
        }
    }
    pub fn identification(&self) -> &IdentificationMethod {
        &self.identification
    }
    pub fn attributes(&self) -> &CiCandidateAttributeData {
        &self.attributes
    }
}

#[derive(Clone, Debug)]
pub struct RelationCandidate {
    from: IdentificationMethod,
    to: IdentificationMethod,
    predicate_id: String,
}
impl RelationCandidate {
    pub fn new(from: IdentificationMethod, to: IdentificationMethod, predicate_id: impl Into<String>) -> Self {
        Self {
            from,
            to,
            predicate_id: predicate_id.into(),
        }
    }
    pub fn predicate_id(&self) -> &str {
        &self.predicate_id
    }
}

/// One batch: CI candidates keyed by temporary CIID, in resolution order,
/// plus relation candidates.
#[derive(Clone, Debug, Default)]
pub struct IngestData {
    ci_candidates: Vec<(Ciid, CiCandidate)>,
    relation_candidates: Vec<RelationCandidate>,
}
impl IngestData {
    pub fn new(ci_candidates: Vec<(Ciid, CiCandidate)>, relation_candidates: Vec<RelationCandidate>) -> Self {
        Self {
            ci_candidates,
            relation_candidates,
        }
    }
    pub fn ci_candidates(&self) -> &[(Ciid, CiCandidate)] {
        &self.ci_candidates
    }
    pub fn relation_candidates(&self) -> &[RelationCandidate] {
        &self.relation_candidates
    }
}

/// Issues the batch changeset on first use, with the caller's user and
/// timestamp.
#[derive(Clone, Debug)]
pub struct ChangesetProxy {
    user_id: i64,
    timestamp: DateTime<Utc>,
    changeset: Option<Changeset>,
}
impl ChangesetProxy {
    pub fn new(user_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id,
            timestamp,
            changeset: None,
        }
    }
    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }
    pub fn changeset(&self) -> Option<&Changeset> {
        self.changeset.as_ref()
    }
    async fn get_or_create<S: Storage>(&mut self, storage: &S, tx: &mut S::Tx) -> Result<Changeset> {
        if let Some(changeset) = &self.changeset {
            return Ok(changeset.clone());
        }
        let changeset = storage.create_changeset(self.user_id, self.timestamp, tx).await?;
        self.changeset = Some(changeset.clone());
        Ok(changeset)
    }
    fn forget(&mut self) {
        self.changeset = None;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub affected_cis: Vec<Ciid>,
    pub created_cis: usize,
    pub written_attributes: usize,
    pub removed_attributes: usize,
    pub written_relations: usize,
    pub removed_relations: usize,
    pub temporary_to_final: HashMap<Ciid, Ciid>,
    pub changeset: Option<ChangesetId>,
}

fn ingest_error(candidate: impl ToString, message: impl Into<String>) -> LayerkeeperError {
    LayerkeeperError::Ingest {
        candidate: candidate.to_string(),
        message: message.into(),
    }
}

pub struct IngestService<'s, S: Storage> {
    storage: &'s S,
    identification: IdentificationService<'s, S>,
}

impl<'s, S: Storage> IngestService<'s, S> {
    pub fn new(storage: &'s S) -> Self {
        Self {
            storage,
            identification: IdentificationService::new(storage),
        }
    }

    pub async fn ingest(
        &self,
        layer: &LayerId,
        data: IngestData,
        changeset: &mut ChangesetProxy,
    ) -> Result<IngestSummary> {
        let mut tx = self.storage.begin().await?;
        match self.ingest_in(layer, data, changeset, &mut tx).await {
            Ok(summary) => {
                self.storage.commit(tx).await?;
                info!(
                    layer = %layer,
                    cis = summary.affected_cis.len(),
                    created = summary.created_cis,
                    attributes = summary.written_attributes,
                    removed = summary.removed_attributes,
                    relations = summary.written_relations,
                    "ingested batch"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(layer = %layer, error = %e, "ingest failed, rolling back");
                if let Err(rollback) = self.storage.rollback(tx).await {
                    warn!(layer = %layer, error = %rollback, "rollback failed");
                }
                changeset.forget();
                Err(e)
            }
        }
    }

    async fn ingest_in(
        &self,
        layer: &LayerId,
        data: IngestData,
        changeset: &mut ChangesetProxy,
        tx: &mut S::Tx,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        let mut context = MappingContext::new(TimeThreshold::Latest);

        // resolve CI candidates in batch order
        let mut fragments_by_ci: Vec<(Ciid, Vec<Fragment>)> = Vec::new();
        let mut position: HashMap<Ciid, usize> = HashMap::new();
        for (temporary, candidate) in data.ci_candidates {
            let name = temporary.to_string();
            let resolved = self
                .identification
                .resolve(&name, candidate.identification(), &mut context, tx)
                .await?;
            let ciid = match resolved {
                Some(ciid) => ciid,
                None => Ciid::generate(),
            };
            if !self.storage.ci_exists(ciid, tx).await? {
                self.storage.create_ci(ciid, tx).await?;
                summary.created_cis += 1;
            }
            context
                .add_temporary(temporary, ciid)
                .map_err(|e| ingest_error(&name, e.to_string()))?;

            let index = *position.entry(ciid).or_insert_with(|| {
                fragments_by_ci.push((ciid, Vec::new()));
                fragments_by_ci.len() - 1
            });
            let fragments = &mut fragments_by_ci[index].1;
            for fragment in candidate.attributes.into_fragments() {
                if fragments.iter().any(|f| f.name() == fragment.name()) {
                    return Err(ingest_error(
                        &name,
                        format!("duplicate attribute '{}' for CI {}", fragment.name(), ciid),
                    ));
                }
                fragments.push(fragment);
            }
        }

        // resolve relation candidates against the now complete temporary table
        let predicates: HashSet<String> = self
            .storage
            .predicates(tx)
            .await?
            .iter()
            .map(|p| p.id().to_owned())
            .collect();
        let mut relations: Vec<RelationKey> = Vec::new();
        for candidate in &data.relation_candidates {
            let name = format!("{} -[{}]-> {}", candidate.from, candidate.predicate_id, candidate.to);
            if !predicates.contains(&candidate.predicate_id) {
                return Err(ingest_error(
                    &name,
                    format!("unknown predicate '{}'", candidate.predicate_id),
                ));
            }
            let from = self
                .identification
                .resolve(&name, &candidate.from, &mut context, tx)
                .await?;
            let to = self
                .identification
                .resolve(&name, &candidate.to, &mut context, tx)
                .await?;
            let (Some(from), Some(to)) = (from, to) else {
                return Err(ingest_error(&name, "relation endpoint could not be resolved"));
            };
            let key = RelationKey {
                from,
                to,
                predicate_id: candidate.predicate_id.clone(),
            };
            if relations.contains(&key) {
                return Err(ingest_error(&name, "duplicate relation"));
            }
            relations.push(key);
        }

        self.replace_attributes(layer, &fragments_by_ci, changeset, &mut summary, tx)
            .await?;
        self.replace_relations(layer, &relations, changeset, &mut summary, tx)
            .await?;

        summary.affected_cis = fragments_by_ci.iter().map(|(ciid, _)| *ciid).collect();
        summary.temporary_to_final = context.temporary_mappings().clone();
        summary.changeset = changeset.changeset().map(Changeset::id);
        Ok(summary)
    }

    async fn replace_attributes(
        &self,
        layer: &LayerId,
        fragments_by_ci: &[(Ciid, Vec<Fragment>)],
        changeset: &mut ChangesetProxy,
        summary: &mut IngestSummary,
        tx: &mut S::Tx,
    ) -> Result<()> {
        let current: HashMap<(String, Ciid), (AttributeState, AttributeValue)> = self
            .storage
            .latest_attributes(layer, &CiSelection::All, &NameSelection::All, TimeThreshold::Latest, tx)
            .await?
            .into_iter()
            .map(|a| (a.key(), (a.state(), a.value().clone())))
            .collect();

        let mut sent: HashSet<(String, Ciid)> = HashSet::new();
        for (ciid, fragments) in fragments_by_ci {
            for fragment in fragments {
                let key = (fragment.name().to_owned(), *ciid);
                let existing = current.get(&key);
                sent.insert(key);
                if let Some((state, value)) = existing {
                    if *state != AttributeState::Removed && value == fragment.value() {
                        continue;
                    }
                }
                let state = AttributeState::following(existing.map(|(state, _)| *state));
                let issued = changeset.get_or_create(self.storage, tx).await?;
                self.storage
                    .write_attribute(layer, fragment.name(), *ciid, fragment.value(), state, &issued, tx)
                    .await?;
                summary.written_attributes += 1;
            }
        }

        for ((name, ciid), (state, value)) in &current {
            if *state == AttributeState::Removed || sent.contains(&(name.clone(), *ciid)) {
                continue;
            }
            let issued = changeset.get_or_create(self.storage, tx).await?;
            self.storage
                .write_attribute(layer, name, *ciid, value, AttributeState::Removed, &issued, tx)
                .await?;
            summary.removed_attributes += 1;
        }
        Ok(())
    }

    async fn replace_relations(
        &self,
        layer: &LayerId,
        relations: &[RelationKey],
        changeset: &mut ChangesetProxy,
        summary: &mut IngestSummary,
        tx: &mut S::Tx,
    ) -> Result<()> {
        let current: HashMap<RelationKey, RelationState> = self
            .storage
            .latest_relations(layer, &CiSelection::All, TimeThreshold::Latest, tx)
            .await?
            .into_iter()
            .map(|r| (r.key(), r.state()))
            .collect();

        for key in relations {
            let state = match current.get(key) {
                None => RelationState::New,
                Some(RelationState::Removed) => RelationState::Renewed,
                Some(_) => continue,
            };
            let issued = changeset.get_or_create(self.storage, tx).await?;
            self.storage
                .write_relation(layer, key.from, key.to, &key.predicate_id, state, &issued, tx)
                .await?;
            summary.written_relations += 1;
        }

        let sent: HashSet<&RelationKey> = relations.iter().collect();
        for (key, state) in &current {
            if *state == RelationState::Removed || sent.contains(key) {
                continue;
            }
            let issued = changeset.get_or_create(self.storage, tx).await?;
            self.storage
                .write_relation(layer, key.from, key.to, &key.predicate_id, RelationState::Removed, &issued, tx)
                .await?;
            summary.removed_relations += 1;
        }
        Ok(())
    }
}

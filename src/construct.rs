//! Fundamental constructs: configuration item identities, layers, layer sets,
//! changesets, time thresholds, attributes, relations and predicates.
//!
//! Every fact (attribute or relation) is written into exactly one layer by
//! exactly one changeset. Nothing in here mutates once created; new versions
//! of a fact are new values.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datatype::AttributeValue;
use crate::error::{LayerkeeperError, Result};

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- Ciid -------------
/// Identity of one configuration item. A CI has no intrinsic properties
/// beyond existing, everything else is attached through attributes and relations.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Ciid(Uuid);

impl Ciid {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}
impl FromStr for Ciid {
    type Err = LayerkeeperError;
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Ciid)
            .map_err(|e| LayerkeeperError::DataCorruption {
                message: format!("'{}' is not a CIID: {}", s, e),
            })
    }
}
impl From<Uuid> for Ciid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
impl fmt::Display for Ciid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const DERIVATION_CONTEXT: &str = "layerkeeper 2024-06-01 ciid derivation v1";

/// Derives a CIID from a namespace and a name, reproducibly on any platform.
///
/// The namespace is turned into a BLAKE3 key (`derive_key` with a fixed
/// context string), the name is hashed with that key, and the first 16 bytes of
/// the digest become the identifier. Version nibble is set to 8 (custom) and the
/// variant bits to RFC 4122, so derived CIIDs never collide with random v4 ones.
pub fn derive_ciid(namespace: &Uuid, name: &str) -> Ciid {
    let key = blake3::derive_key(DERIVATION_CONTEXT, namespace.as_bytes());
    let digest = blake3::keyed_hash(&key, name.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x80;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Ciid(Uuid::from_bytes(bytes))
}

// ------------- Layer -------------
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}
impl From<String> for LayerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
}
impl Layer {
    pub fn new(id: LayerId, name: String) -> Self {
        Self { id, name }
    }
    pub fn id(&self) -> &LayerId {
        &self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}

// ------------- LayerSet -------------
/// An ordered stack of layers. Later entries shadow earlier entries for the
/// same fact.
#[derive(Clone, Debug, Default, Eq)]
pub struct LayerSet {
    layers: Vec<LayerId>,
}

impl LayerSet {
    pub fn new(layers: Vec<LayerId>) -> Self {
        Self { layers }
    }
    pub fn from_ids<I, L>(ids: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        Self {
            layers: ids.into_iter().map(Into::into).collect(),
        }
    }
    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }
    pub fn iter(&self) -> std::slice::Iter<'_, LayerId> {
        self.layers.iter()
    }
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    pub fn contains(&self, layer: &LayerId) -> bool {
        self.layers.contains(layer)
    }
    /// Polynomial rolling hash over the member layers; wraps on overflow and
    /// changes whenever the order changes.
    pub fn rolling_hash(&self) -> u64 {
        self.layers.iter().fold(17u64, |hash, layer| {
            hash.wrapping_mul(31)
                .wrapping_add(seahash::hash(layer.as_str().as_bytes()))
        })
    }
}
impl PartialEq for LayerSet {
    fn eq(&self, other: &Self) -> bool {
        self.layers == other.layers
    }
}
impl Hash for LayerSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.rolling_hash());
    }
}
impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids: Vec<&str> = self.layers.iter().map(LayerId::as_str).collect();
        write!(f, "[{}]", ids.join(","))
    }
}

// ------------- Changeset -------------
pub type ChangesetId = Uuid;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Changeset {
    id: ChangesetId,
    user_id: i64,
    timestamp: DateTime<Utc>,
}
impl Changeset {
    pub fn new(id: ChangesetId, user_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            timestamp,
        }
    }
    pub fn id(&self) -> ChangesetId {
        self.id
    }
    pub fn user_id(&self) -> i64 {
        self.user_id
    }
    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }
}

// ------------- TimeThreshold -------------
/// Point in time a read is made at. Stored changeset timestamps have
/// microsecond resolution, and `At` thresholds are compared at the same
/// resolution.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum TimeThreshold {
    #[default]
    Latest,
    At(DateTime<Utc>),
}
impl TimeThreshold {
    pub fn latest() -> Self {
        Self::Latest
    }
    pub fn at(time: DateTime<Utc>) -> Self {
        Self::At(time)
    }
    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }
    /// Whether a version authored at `time` is visible under this threshold.
    pub fn admits(&self, time: &DateTime<Utc>) -> bool {
        match self {
            Self::Latest => true,
            Self::At(threshold) => time <= threshold,
        }
    }
}
impl fmt::Display for TimeThreshold {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::At(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

// ------------- States -------------
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum AttributeState {
    New,
    Changed,
    Removed,
    Renewed,
}
impl AttributeState {
    pub fn identifier(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Changed => 1,
            Self::Removed => 2,
            Self::Renewed => 3,
        }
    }
    pub fn from_identifier(identifier: u8) -> Result<Self> {
        match identifier {
            0 => Ok(Self::New),
            1 => Ok(Self::Changed),
            2 => Ok(Self::Removed),
            3 => Ok(Self::Renewed),
            other => Err(LayerkeeperError::DataCorruption {
                message: format!("unknown attribute state {}", other),
            }),
        }
    }
    /// State of a new version written on top of `current`.
    pub fn following(current: Option<AttributeState>) -> Self {
        match current {
            None => Self::New,
            Some(Self::Removed) => Self::Renewed,
            Some(_) => Self::Changed,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RelationState {
    New,
    Removed,
    Renewed,
}
impl RelationState {
    pub fn identifier(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Removed => 2,
            Self::Renewed => 3,
        }
    }
    pub fn from_identifier(identifier: u8) -> Result<Self> {
        match identifier {
            0 => Ok(Self::New),
            2 => Ok(Self::Removed),
            3 => Ok(Self::Renewed),
            other => Err(LayerkeeperError::DataCorruption {
                message: format!("unknown relation state {}", other),
            }),
        }
    }
}

// ------------- Attribute -------------
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Attribute {
    id: Uuid,
    name: String,
    ciid: Ciid,
    value: AttributeValue,
    state: AttributeState,
    changeset_id: ChangesetId,
}
impl Attribute {
    pub fn new(
        id: Uuid,
        name: String,
        ciid: Ciid,
        value: AttributeValue,
        state: AttributeState,
        changeset_id: ChangesetId,
    ) -> Self {
        Self {
            id,
            name,
            ciid,
            value,
            state,
            changeset_id,
        }
    }
    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn ciid(&self) -> Ciid {
        self.ciid
    }
    pub fn value(&self) -> &AttributeValue {
        &self.value
    }
    pub fn state(&self) -> AttributeState {
        self.state
    }
    pub fn changeset_id(&self) -> ChangesetId {
        self.changeset_id
    }
    pub fn is_removed(&self) -> bool {
        self.state == AttributeState::Removed
    }
    // two versions describe the same fact when name and ci match
    pub fn key(&self) -> (String, Ciid) {
        (self.name.clone(), self.ciid)
    }
}
impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{} = {} ({:?})",
            self.ciid, self.name, self.value, self.state
        )
    }
}

/// The winning version of an attribute together with every layer of the
/// queried stack that currently holds a live version, in stack order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MergedCiAttribute {
    attribute: Attribute,
    layer_stack_ids: Vec<LayerId>,
}
impl MergedCiAttribute {
    pub fn new(attribute: Attribute, layer_stack_ids: Vec<LayerId>) -> Self {
        Self {
            attribute,
            layer_stack_ids,
        }
    }
    pub fn attribute(&self) -> &Attribute {
        &self.attribute
    }
    pub fn layer_stack_ids(&self) -> &[LayerId] {
        &self.layer_stack_ids
    }
    pub fn layer_id(&self) -> Option<&LayerId> {
        self.layer_stack_ids.last()
    }
}

// ------------- Relation -------------
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RelationKey {
    pub from: Ciid,
    pub to: Ciid,
    pub predicate_id: String,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Relation {
    id: Uuid,
    from: Ciid,
    to: Ciid,
    predicate_id: String,
    state: RelationState,
    changeset_id: ChangesetId,
}
impl Relation {
    pub fn new(
        id: Uuid,
        from: Ciid,
        to: Ciid,
        predicate_id: String,
        state: RelationState,
        changeset_id: ChangesetId,
    ) -> Self {
        Self {
            id,
            from,
            to,
            predicate_id,
            state,
            changeset_id,
        }
    }
    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn from(&self) -> Ciid {
        self.from
    }
    pub fn to(&self) -> Ciid {
        self.to
    }
    pub fn predicate_id(&self) -> &str {
        &self.predicate_id
    }
    pub fn state(&self) -> RelationState {
        self.state
    }
    pub fn changeset_id(&self) -> ChangesetId {
        self.changeset_id
    }
    pub fn is_removed(&self) -> bool {
        self.state == RelationState::Removed
    }
    pub fn key(&self) -> RelationKey {
        RelationKey {
            from: self.from,
            to: self.to,
            predicate_id: self.predicate_id.clone(),
        }
    }
}
impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} -[{}]-> {} ({:?})",
            self.from, self.predicate_id, self.to, self.state
        )
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MergedRelation {
    relation: Relation,
    layer_stack_ids: Vec<LayerId>,
}
impl MergedRelation {
    pub fn new(relation: Relation, layer_stack_ids: Vec<LayerId>) -> Self {
        Self {
            relation,
            layer_stack_ids,
        }
    }
    pub fn relation(&self) -> &Relation {
        &self.relation
    }
    pub fn layer_stack_ids(&self) -> &[LayerId] {
        &self.layer_stack_ids
    }
    pub fn layer_id(&self) -> Option<&LayerId> {
        self.layer_stack_ids.last()
    }
}

// ------------- Predicate -------------
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub enum AnchorState {
    #[default]
    Active,
    Deprecated,
    Inactive,
    MarkedForDeletion,
}
impl AnchorState {
    pub fn identifier(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Deprecated => 1,
            Self::Inactive => 2,
            Self::MarkedForDeletion => 3,
        }
    }
    pub fn from_identifier(identifier: u8) -> Result<Self> {
        match identifier {
            0 => Ok(Self::Active),
            1 => Ok(Self::Deprecated),
            2 => Ok(Self::Inactive),
            3 => Ok(Self::MarkedForDeletion),
            other => Err(LayerkeeperError::DataCorruption {
                message: format!("unknown anchor state {}", other),
            }),
        }
    }
}

/// Trait names the endpoints of a relation are expected to carry. Stored
/// with the predicate, not evaluated here.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct PredicateConstraints {
    pub from_traits: Vec<String>,
    pub to_traits: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Predicate {
    id: String,
    wording_from: String,
    wording_to: String,
    anchor_state: AnchorState,
    constraints: PredicateConstraints,
}
impl Predicate {
    pub fn new(
        id: String,
        wording_from: String,
        wording_to: String,
        anchor_state: AnchorState,
        constraints: PredicateConstraints,
    ) -> Self {
        Self {
            id,
            wording_from,
            wording_to,
            anchor_state,
            constraints,
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn wording_from(&self) -> &str {
        &self.wording_from
    }
    pub fn wording_to(&self) -> &str {
        &self.wording_to
    }
    pub fn anchor_state(&self) -> AnchorState {
        self.anchor_state
    }
    pub fn constraints(&self) -> &PredicateConstraints {
        &self.constraints
    }
}

// ------------- Selections -------------
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum CiSelection {
    #[default]
    All,
    Specific(HashSet<Ciid>),
}
impl CiSelection {
    pub fn specific<I: IntoIterator<Item = Ciid>>(ciids: I) -> Self {
        Self::Specific(ciids.into_iter().collect())
    }
    pub fn contains(&self, ciid: &Ciid) -> bool {
        match self {
            Self::All => true,
            Self::Specific(ciids) => ciids.contains(ciid),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum NameSelection {
    #[default]
    All,
    Specific(HashSet<String>),
}
impl NameSelection {
    pub fn specific<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Specific(names.into_iter().map(Into::into).collect())
    }
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Specific(names) => names.contains(name),
        }
    }
}

// ------------- Lookups -------------
/// One-to-many index that remembers the order in which values arrived.
#[derive(Debug)]
pub struct Lookup<K, V, H = RandomState> {
    index: HashMap<K, Vec<V>, H>,
}
impl<K: Eq + Hash, V: Eq, H: BuildHasher + Default> Lookup<K, V, H> {
    pub fn new() -> Self {
        Self {
            index: HashMap::<K, Vec<V>, H>::default(),
        }
    }
    pub fn insert(&mut self, key: K, value: V) {
        let values = self.index.entry(key).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }
    pub fn lookup(&self, key: &K) -> &[V] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
    pub fn len(&self) -> usize {
        self.index.len()
    }
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
impl<K: Eq + Hash, V: Eq, H: BuildHasher + Default> Default for Lookup<K, V, H> {
    fn default() -> Self {
        Self::new()
    }
}

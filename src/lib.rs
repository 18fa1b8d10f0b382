//! Layerkeeper – the core of a layered configuration management database.
//!
//! Facts about configuration items (CIs) are attributes and relations. Each
//! fact lives in exactly one *layer* and every version of it is written by an
//! immutable *changeset*, so the database can be read as of any past moment.
//! Readers ask for a merged view through an ordered [`construct::LayerSet`]:
//! later layers shadow earlier ones per fact, never per CI.
//!
//! ## Modules
//! * [`construct`] – CIIDs, layers, layer sets, changesets, time thresholds,
//!   attributes, relations, predicates and small lookup helpers.
//! * [`datatype`] – typed attribute values (text, integer, decimal, JSON, time
//!   and homogeneous arrays of those) and their storage form.
//! * [`storage`] – the transactional [`storage::Storage`] and
//!   [`storage::ScopeMapPersister`] traits the core is written against.
//! * [`persist`] – the SQLite implementation of both traits.
//! * [`merge`] – the layer merge engine.
//! * [`identify`] – identification methods and the CI identification service.
//! * [`ingest`] – batch ingest of CI and relation candidates into a layer.
//! * [`external`] – external ID reconciliation per adapter scope.
//! * [`runner`] – scheduling of reconciliation runs for many adapters.
//! * [`settings`] – runtime settings.
//!
//! ## Quick Start
//! ```
//! use layerkeeper::construct::{CiSelection, LayerSet, NameSelection, TimeThreshold};
//! use layerkeeper::merge::MergeEngine;
//! use layerkeeper::persist::{PersistenceMode, Persistor};
//! use layerkeeper::storage::Storage;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let persistor = Persistor::new(PersistenceMode::InMemory).unwrap();
//! let mut tx = persistor.begin().await.unwrap();
//! let merged = MergeEngine::new(&persistor)
//!     .merged_attributes(
//!         &CiSelection::All,
//!         &NameSelection::All,
//!         &LayerSet::from_ids(["base", "override"]),
//!         TimeThreshold::Latest,
//!         &mut tx,
//!     )
//!     .await
//!     .unwrap();
//! assert!(merged.is_empty());
//! # });
//! ```

pub mod construct;
pub mod datatype;
pub mod error;
pub mod external;
pub mod identify;
pub mod ingest;
pub mod merge;
pub mod persist;
pub mod runner;
pub mod settings;
pub mod storage;

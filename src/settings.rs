//! Runtime settings: built-in defaults, then an optional TOML file, then
//! `LAYERKEEPER__*` environment variables.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::construct::{Layer, LayerId, LayerSet};
use crate::error::Result;
use crate::persist::PersistenceMode;

const DEFAULT_FILE: &str = "layerkeeper";

#[derive(Clone, Debug, Deserialize)]
pub struct LayerSettings {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReconciliationSettings {
    pub timeout_seconds: u64,
    pub update_rate_seconds: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Path of the SQLite file; in-memory when absent.
    pub database: Option<String>,
    pub log_filter: String,
    pub reconciliation: ReconciliationSettings,
    #[serde(default)]
    pub layers: Vec<LayerSettings>,
    #[serde(default)]
    pub layer_sets: HashMap<String, Vec<String>>,
    /// Layer set the binary prints.
    pub view: Option<String>,
}

impl Settings {
    /// Loads settings from `path`, or from `layerkeeper.toml` in the working
    /// directory if it exists.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings = Config::builder()
            .set_default("log_filter", "info")?
            .set_default("reconciliation.timeout_seconds", 300)?
            .set_default("reconciliation.update_rate_seconds", 300)?
            .add_source(File::with_name(path.unwrap_or(DEFAULT_FILE)).required(path.is_some()))
            .add_source(Environment::with_prefix("LAYERKEEPER").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.layers
            .iter()
            .map(|l| Layer::new(LayerId::new(l.id.clone()), l.name.clone()))
            .collect()
    }

    pub fn layer_set(&self, name: &str) -> Option<LayerSet> {
        self.layer_sets.get(name).map(|ids| LayerSet::from_ids(ids.iter().cloned()))
    }

    pub fn reconciliation_timeout(&self) -> Duration {
        Duration::from_secs(self.reconciliation.timeout_seconds)
    }

    pub fn update_rate(&self) -> Duration {
        Duration::from_secs(self.reconciliation.update_rate_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
database = "cmdb.sqlite"

[reconciliation]
timeout_seconds = 10

[[layers]]
id = "base"
name = "Base"

[[layers]]
id = "override"
name = "Manual overrides"

[layer_sets]
default = ["base", "override"]
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.reconciliation_timeout(), Duration::from_secs(10));
        assert_eq!(settings.update_rate(), Duration::from_secs(300));
        assert_eq!(settings.layers().len(), 2);
        assert!(matches!(settings.persistence_mode(), PersistenceMode::File(_)));
        assert_eq!(
            settings.layer_set("default"),
            Some(LayerSet::from_ids(["base", "override"]))
        );
        assert!(settings.layer_set("missing").is_none());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some("/nonexistent/layerkeeper-settings.toml")).is_err());
    }
}

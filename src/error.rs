use thiserror::Error;

use crate::construct::Ciid;

#[derive(Error, Debug)]
pub enum LayerkeeperError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Could not find temporary CIID {temporary} while trying to match CI candidate {candidate}")]
    UnresolvedTemporaryCiid { candidate: String, temporary: Ciid },
    #[error("Ingest of candidate {candidate} failed: {message}")]
    Ingest { candidate: String, message: String },
    #[error("Adapter {scope} failed: {message}")]
    Adapter { scope: String, message: String },
    #[error("Reconciliation of {scope} exceeded {seconds}s")]
    Timeout { scope: String, seconds: u64 },
    #[error("Invalid scope name: {0}")]
    InvalidScope(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, LayerkeeperError>;

// Helper conversions
impl From<rusqlite::Error> for LayerkeeperError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<config::ConfigError> for LayerkeeperError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<serde_json::Error> for LayerkeeperError {
    fn from(e: serde_json::Error) -> Self {
        Self::DataCorruption {
            message: e.to_string(),
        }
    }
}

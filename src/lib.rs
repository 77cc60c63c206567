//! Music library identity resolution: fingerprint enrichment and duplicate cleanup.

pub mod backends;
pub mod config;
pub mod db_manager;
pub mod error;
pub mod library;
pub mod metadata;
pub mod protocol;

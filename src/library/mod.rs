//! Identity resolution and duplicate handling over the library database.

pub mod candidate_resolver;
pub mod duplicate_clustering;
pub mod duplicate_resolution;
pub mod fingerprint_cache;
pub mod library_enrichment_manager;

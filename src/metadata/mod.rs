//! Audio file tag access.

pub mod metadata_tags;

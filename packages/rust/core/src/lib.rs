//! Core reconciliation and cycle orchestration for wikiactivity.
//!
//! This crate ties together source parsing, normalization and the activity
//! store into end-to-end workflows:
//! - [`reconciler::Reconciler`]: the merge policy for cross-source observations
//! - [`pipeline::run_cycle`]: one concurrent fetch/parse/merge pass over all sites
//! - [`projector::project`]: grouped, ordered snapshots for reporting

pub mod fetch;
pub mod pipeline;
pub mod projector;
pub mod reconciler;
pub mod summary;

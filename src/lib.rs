//! PastLead: rebuilds email conversations from header references and ranks
//! them as sales leads.
//!
//! The binary drives these modules; each pipeline stage takes the `LeadDb`
//! handle explicitly.

pub mod backfill;
pub mod closeness;
pub mod db;
pub mod error;
pub mod filters;
pub mod ingest;
mod migrations;
pub mod pipeline;
pub mod scoring;
pub mod state;
pub mod threading;
pub mod types;

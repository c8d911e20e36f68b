//! Cost ledger entities and aggregate summaries.
//!
//! The ledger itself lives in the store (`cost_log` table); this module only
//! holds the value types it reads and writes.

pub mod types;

pub use types::{CostEntry, CostSummary, DailyCost, ProviderCostSummary};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One append-only ledger row, logged once per billable provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub iteration_id: String,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    /// Amount in USD.
    pub cost: f64,
    pub image_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl CostEntry {
    /// Build an entry stamped with the current time.
    pub fn new(
        iteration_id: impl Into<String>,
        session_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        cost: f64,
        image_count: u32,
    ) -> Self {
        Self {
            iteration_id: iteration_id.into(),
            session_id: session_id.into(),
            provider: provider.into(),
            model: model.into(),
            cost,
            image_count,
            timestamp: crate::util::timestamp_now(),
        }
    }
}

/// Aggregate over a set of ledger rows. All zero for an empty set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub image_count: u64,
    pub entry_count: u64,
}

/// Per-provider aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCostSummary {
    pub provider: String,
    pub total_cost: f64,
    pub image_count: u64,
}

/// Per-UTC-day aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCost {
    pub day: NaiveDate,
    pub total_cost: f64,
    pub image_count: u64,
    pub entry_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_summary_default_is_zero() {
        let summary = CostSummary::default();
        assert_eq!(summary.total_cost, 0.0);
        assert_eq!(summary.image_count, 0);
        assert_eq!(summary.entry_count, 0);
    }

    #[test]
    fn cost_entry_new_stamps_current_time() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let entry = CostEntry::new("it-1", "s-1", "openai", "gpt-image-1", 0.04, 1);
        assert!(entry.timestamp >= before);
        assert_eq!(entry.provider, "openai");
        assert_eq!(entry.image_count, 1);
    }
}

//! Append-only cost ledger queries.
//!
//! Every aggregate returns a zero summary for an empty result set, never an
//! error.

use super::{format_timestamp, parse_timestamp, Store};
use crate::cost::{CostEntry, CostSummary, DailyCost, ProviderCostSummary};
use crate::error::{Error, ResultExt};
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, ToSql};

const SUMMARY_SELECT: &str =
    "SELECT COALESCE(SUM(cost), 0.0), COALESCE(SUM(image_count), 0), COUNT(*) FROM cost_log";

impl Store {
    /// Append one ledger row and return its id.
    pub fn log_cost(&self, entry: &CostEntry) -> Result<i64> {
        if !entry.cost.is_finite() || entry.cost < 0.0 {
            return Err(Error::InvalidInput(
                "cost must be a finite, non-negative value".into(),
            ));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cost_log (iteration_id, session_id, provider, model, cost, image_count, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.iteration_id,
                entry.session_id,
                entry.provider,
                entry.model,
                entry.cost,
                entry.image_count,
                format_timestamp(&entry.timestamp),
            ],
        )
        .context("failed to log cost")?;
        let id = conn.last_insert_rowid();
        tracing::debug!(
            id,
            session_id = %entry.session_id,
            provider = %entry.provider,
            cost = entry.cost,
            "logged cost"
        );
        Ok(id)
    }

    /// Spend in `[start, end)`.
    pub fn get_cost_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CostSummary> {
        let conn = self.lock()?;
        query_summary(
            &conn,
            "WHERE timestamp >= ?1 AND timestamp < ?2",
            &[&format_timestamp(&start), &format_timestamp(&end)],
        )
        .context("failed to get cost by date range")
    }

    /// Spend grouped by provider, ordered by provider name.
    pub fn get_cost_by_provider(&self) -> Result<Vec<ProviderCostSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT provider, COALESCE(SUM(cost), 0.0), COALESCE(SUM(image_count), 0)
                 FROM cost_log GROUP BY provider ORDER BY provider",
            )
            .context("failed to get cost by provider")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProviderCostSummary {
                    provider: row.get(0)?,
                    total_cost: row.get(1)?,
                    image_count: count_at(row, 2)?,
                })
            })
            .context("failed to get cost by provider")?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.context("failed to read provider cost row")?);
        }
        Ok(summaries)
    }

    /// Spend across the whole ledger.
    pub fn get_total_cost(&self) -> Result<CostSummary> {
        let conn = self.lock()?;
        query_summary(&conn, "", &[]).context("failed to get total cost")
    }

    /// Spend attributed to one session.
    pub fn get_session_cost(&self, session_id: &str) -> Result<CostSummary> {
        let conn = self.lock()?;
        query_summary(&conn, "WHERE session_id = ?1", &[&session_id])
            .context("failed to get session cost")
    }

    /// Spend in `[start, end)` broken down per UTC day, oldest first.
    /// Days without entries are omitted.
    pub fn get_daily_costs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyCost>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT substr(timestamp, 1, 10) AS day,
                        COALESCE(SUM(cost), 0.0), COALESCE(SUM(image_count), 0), COUNT(*)
                 FROM cost_log
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 GROUP BY day ORDER BY day",
            )
            .context("failed to get daily costs")?;
        let rows = stmt
            .query_map(
                params![format_timestamp(&start), format_timestamp(&end)],
                |row| {
                    let raw: String = row.get(0)?;
                    let day = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                    })?;
                    Ok(DailyCost {
                        day,
                        total_cost: row.get(1)?,
                        image_count: count_at(row, 2)?,
                        entry_count: count_at(row, 3)?,
                    })
                },
            )
            .context("failed to get daily costs")?;

        let mut days = Vec::new();
        for row in rows {
            days.push(row.context("failed to read daily cost row")?);
        }
        Ok(days)
    }

    /// Ledger rows for one session in the order they were logged.
    pub fn list_session_costs(&self, session_id: &str) -> Result<Vec<CostEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT iteration_id, session_id, provider, model, cost, image_count, timestamp
                 FROM cost_log WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .context("failed to list session costs")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(CostEntry {
                    iteration_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    session_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    provider: row.get(2)?,
                    model: row.get(3)?,
                    cost: row.get(4)?,
                    image_count: row.get(5)?,
                    timestamp: parse_timestamp(6, &row.get::<_, String>(6)?)?,
                })
            })
            .context("failed to list session costs")?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to read cost row")?);
        }
        Ok(entries)
    }
}

fn query_summary(
    conn: &Connection,
    where_sql: &str,
    bind: &[&dyn ToSql],
) -> rusqlite::Result<CostSummary> {
    conn.query_row(&format!("{SUMMARY_SELECT} {where_sql}"), bind, |row| {
        Ok(CostSummary {
            total_cost: row.get(0)?,
            image_count: count_at(row, 1)?,
            entry_count: count_at(row, 2)?,
        })
    })
}

fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(u64::try_from(row.get::<_, i64>(idx)?).unwrap_or_default())
}

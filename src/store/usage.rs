//! Daily usage counters and the embedder's budget view

use super::Store;
use crate::embedder::UsageTracker;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use utoipa::ToSchema;

/// Aggregate spend for one tenant over a period
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UsageSummary {
    pub tokens: i64,
    pub api_calls: i64,
    pub estimated_cost: f64,
}

impl Store {
    /// Add to today's counter for a tenant
    pub async fn record_usage(
        &self,
        tenant: &str,
        tokens: u64,
        api_calls: u64,
        cost: f64,
    ) -> Result<()> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        sqlx::query(
            r#"
            INSERT INTO usage_counters (tenant, day, tokens, api_calls, estimated_cost)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tenant, day) DO UPDATE SET
                tokens = tokens + excluded.tokens,
                api_calls = api_calls + excluded.api_calls,
                estimated_cost = estimated_cost + excluded.estimated_cost
            "#,
        )
        .bind(tenant)
        .bind(&day)
        .bind(tokens as i64)
        .bind(api_calls as i64)
        .bind(cost)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Spend for a tenant within one `YYYY-MM` month
    pub async fn usage_for_month(&self, tenant: &str, month: &str) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(tokens), 0) AS tokens,
                   COALESCE(SUM(api_calls), 0) AS api_calls,
                   COALESCE(SUM(estimated_cost), 0.0) AS estimated_cost
            FROM usage_counters
            WHERE tenant = ?1 AND day LIKE ?2 || '-%'
            "#,
        )
        .bind(tenant)
        .bind(month)
        .fetch_one(self.pool())
        .await?;

        Ok(UsageSummary {
            tokens: row.get("tokens"),
            api_calls: row.get("api_calls"),
            estimated_cost: row.get("estimated_cost"),
        })
    }

    /// Drop counters older than the retention window; run by the nightly
    /// maintenance task
    pub async fn compact_usage(&self, keep_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(keep_days))
            .format("%Y-%m-%d")
            .to_string();
        let result = sqlx::query("DELETE FROM usage_counters WHERE day < ?1")
            .bind(&cutoff)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UsageTracker for Store {
    async fn record(&self, tenant: &str, tokens: u64, calls: u64, cost: f64) -> Result<()> {
        self.record_usage(tenant, tokens, calls, cost).await
    }

    async fn month_tokens(&self, tenant: &str, month: &str) -> Result<u64> {
        Ok(self.usage_for_month(tenant, month).await?.tokens.max(0) as u64)
    }
}

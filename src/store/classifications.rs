//! Classification rows: one per document, replaced wholesale on reclassify

use super::{format_ts, parse_ts, Store};
use crate::classifier::{Confidentiality, DocumentClassification, OrgContext};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

/// A stored classification record
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClassificationRow {
    pub document_id: Uuid,
    pub tenant: String,
    #[serde(flatten)]
    pub fields: DocumentClassification,
    pub classified_at: DateTime<Utc>,
}

fn row_to_classification(row: &sqlx::sqlite::SqliteRow) -> Result<ClassificationRow> {
    let document_id: String = row.get("document_id");
    let confidentiality: String = row.get("confidentiality");
    let people: String = row.get("people");
    let tags: String = row.get("tags");
    let confidence: String = row.get("confidence");
    let classified_at: String = row.get("classified_at");

    let confidentiality: Confidentiality =
        serde_json::from_value(serde_json::Value::String(confidentiality))
            .map_err(CoreError::Serialization)?;

    Ok(ClassificationRow {
        document_id: Uuid::parse_str(&document_id)
            .map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
        tenant: row.get("tenant"),
        fields: DocumentClassification {
            team: row.get("team"),
            project: row.get("project"),
            doc_type: row.get("doc_type"),
            time_period: row.get("time_period"),
            confidentiality,
            people: serde_json::from_str(&people).unwrap_or_default(),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            summary: row.get("summary"),
            confidence: serde_json::from_str(&confidence).unwrap_or_default(),
        },
        classified_at: parse_ts(&classified_at),
    })
}

impl Store {
    /// Upsert the classification for a document, replacing the row wholesale
    pub async fn upsert_classification(
        &self,
        tenant: &str,
        document_id: Uuid,
        fields: &DocumentClassification,
    ) -> Result<()> {
        fields.validate()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO classifications
                (document_id, tenant, team, project, doc_type, time_period,
                 confidentiality, people, tags, summary, confidence,
                 classified_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(document_id.to_string())
        .bind(tenant)
        .bind(&fields.team)
        .bind(&fields.project)
        .bind(&fields.doc_type)
        .bind(&fields.time_period)
        .bind(confidentiality_str(fields.confidentiality))
        .bind(serde_json::to_string(&fields.people)?)
        .bind(serde_json::to_string(&fields.tags)?)
        .bind(&fields.summary)
        .bind(serde_json::to_string(&fields.confidence)?)
        .bind(format_ts(Utc::now()))
        .execute(self.pool())
        .await?;

        // the tenant's vocabulary changed
        self.org_context_cache.write().await.remove(tenant);
        debug!(document = %document_id, "classification written");
        Ok(())
    }

    /// Fetch a document's classification
    pub async fn get_classification(
        &self,
        tenant: &str,
        document_id: Uuid,
    ) -> Result<Option<ClassificationRow>> {
        let row = sqlx::query(
            "SELECT * FROM classifications WHERE document_id = ?1 AND tenant = ?2",
        )
        .bind(document_id.to_string())
        .bind(tenant)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(row_to_classification).transpose()
    }

    /// Distinct organizational vocabulary for a tenant, served from the
    /// soft cache when warm
    pub async fn org_context(&self, tenant: &str) -> Result<OrgContext> {
        if let Some(cached) = self.org_context_cache.read().await.get(tenant) {
            return Ok(cached.clone());
        }

        let mut context = OrgContext::default();
        for (column, target) in [("team", 0usize), ("project", 1), ("doc_type", 2)] {
            let query = format!(
                "SELECT DISTINCT {col} AS v FROM classifications
                 WHERE tenant = ?1 AND {col} IS NOT NULL AND {col} != ''
                 ORDER BY v",
                col = column
            );
            let rows = sqlx::query(&query).bind(tenant).fetch_all(self.pool()).await?;
            let values: Vec<String> = rows.into_iter().map(|r| r.get("v")).collect();
            match target {
                0 => context.teams = values,
                1 => context.projects = values,
                _ => context.doc_types = values,
            }
        }

        self.org_context_cache
            .write()
            .await
            .insert(tenant.to_string(), context.clone());
        Ok(context)
    }

    /// Classification counts for the status endpoint
    pub async fn classification_count(&self, tenant: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM classifications WHERE tenant = ?1")
            .bind(tenant)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("n"))
    }
}

fn confidentiality_str(c: Confidentiality) -> &'static str {
    match c {
        Confidentiality::Public => "public",
        Confidentiality::Internal => "internal",
        Confidentiality::Confidential => "confidential",
        Confidentiality::Restricted => "restricted",
    }
}

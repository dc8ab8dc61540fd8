//! Smart folders: faceted views over classification metadata
//!
//! Five views, each scoped to one tenant and backed by the covering indexes
//! on `(tenant, facet)`. The person view unnests the `people` JSON array with
//! SQLite's `json_each`. Soft-deleted documents never appear.

use crate::error::{CoreError, Result};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// The five facet dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FolderView {
    Team,
    Project,
    Type,
    Date,
    Person,
}

impl FolderView {
    /// URL path segment for the view
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "team" => Some(Self::Team),
            "project" => Some(Self::Project),
            "type" => Some(Self::Type),
            "date" => Some(Self::Date),
            "person" => Some(Self::Person),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::Team => "team",
            Self::Project => "project",
            Self::Type => "doc_type",
            Self::Date => "time_period",
            Self::Person => "people",
        }
    }
}

/// Document summary inside a folder bucket
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FolderDocument {
    pub id: Uuid,
    pub filename: String,
    pub file_type: String,
    pub upload_date: String,
    pub status: String,
    pub summary: String,
}

/// One facet bucket
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FolderBucket {
    pub facet_value: String,
    pub count: i64,
    pub documents: Vec<FolderDocument>,
}

/// Faceted aggregation service
#[derive(Clone)]
pub struct FolderQueryService {
    store: Store,
}

impl FolderQueryService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compute a folder view; `filter` narrows the result to one bucket
    pub async fn view(
        &self,
        tenant: &str,
        view: FolderView,
        filter: Option<&str>,
    ) -> Result<Vec<FolderBucket>> {
        let rows = match view {
            FolderView::Person => self.person_rows(tenant, filter).await?,
            _ => self.scalar_rows(tenant, view.column(), filter).await?,
        };

        let mut buckets: HashMap<String, Vec<FolderDocument>> = HashMap::new();
        for (facet, document) in rows {
            buckets.entry(facet).or_default().push(document);
        }

        let mut result: Vec<FolderBucket> = buckets
            .into_iter()
            .map(|(facet_value, documents)| FolderBucket {
                facet_value,
                count: documents.len() as i64,
                documents,
            })
            .collect();

        result.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.facet_value.cmp(&b.facet_value))
        });
        Ok(result)
    }

    async fn scalar_rows(
        &self,
        tenant: &str,
        column: &str,
        filter: Option<&str>,
    ) -> Result<Vec<(String, FolderDocument)>> {
        let mut sql = format!(
            r#"
            SELECT c.{col} AS facet_value,
                   d.id, d.filename, d.file_type, d.uploaded_at, d.status,
                   c.summary
            FROM classifications c
            JOIN documents d ON d.id = c.document_id
            WHERE c.tenant = ?1 AND d.is_deleted = 0
              AND c.{col} IS NOT NULL AND c.{col} != ''
            "#,
            col = column
        );
        if filter.is_some() {
            sql.push_str(&format!("AND c.{} = ?2\n", column));
        }
        sql.push_str("ORDER BY d.uploaded_at DESC");

        let mut query = sqlx::query(&sql).bind(tenant);
        if let Some(value) = filter {
            query = query.bind(value);
        }

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn person_rows(
        &self,
        tenant: &str,
        filter: Option<&str>,
    ) -> Result<Vec<(String, FolderDocument)>> {
        let mut sql = r#"
            SELECT je.value AS facet_value,
                   d.id, d.filename, d.file_type, d.uploaded_at, d.status,
                   c.summary
            FROM classifications c
            JOIN documents d ON d.id = c.document_id,
                 json_each(c.people) AS je
            WHERE c.tenant = ?1 AND d.is_deleted = 0
            "#
        .to_string();
        if filter.is_some() {
            sql.push_str("AND je.value = ?2\n");
        }
        sql.push_str("ORDER BY d.uploaded_at DESC");

        let mut query = sqlx::query(&sql).bind(tenant);
        if let Some(value) = filter {
            query = query.bind(value);
        }

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<(String, FolderDocument)> {
    let id: String = row.get("id");
    Ok((
        row.get("facet_value"),
        FolderDocument {
            id: Uuid::parse_str(&id)
                .map_err(|e| CoreError::Database(sqlx::Error::Decode(e.into())))?,
            filename: row.get("filename"),
            file_type: row.get("file_type"),
            upload_date: row.get("uploaded_at"),
            status: row.get("status"),
            summary: row.get("summary"),
        },
    ))
}

//! Employee profile embedding records

use super::{format_ts, parse_ts, Store};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use utoipa::ToSchema;

/// Pointer from a user profile to its vector in the tenant namespace
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmployeeEmbedding {
    pub user_id: String,
    pub tenant: String,
    pub vector_id: String,
    pub profile_snapshot: String,
    pub last_updated: DateTime<Utc>,
}

fn row_to_employee(row: &sqlx::sqlite::SqliteRow) -> EmployeeEmbedding {
    let last_updated: String = row.get("last_updated");
    EmployeeEmbedding {
        user_id: row.get("user_id"),
        tenant: row.get("tenant"),
        vector_id: row.get("vector_id"),
        profile_snapshot: row.get("profile_snapshot"),
        last_updated: parse_ts(&last_updated),
    }
}

impl Store {
    /// One record per (user, tenant); regeneration replaces it
    pub async fn upsert_employee_embedding(
        &self,
        user_id: &str,
        tenant: &str,
        vector_id: &str,
        profile_snapshot: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO employee_embeddings
                (user_id, tenant, vector_id, profile_snapshot, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(user_id)
        .bind(tenant)
        .bind(vector_id)
        .bind(profile_snapshot)
        .bind(format_ts(Utc::now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_employee_embedding(
        &self,
        tenant: &str,
        user_id: &str,
    ) -> Result<Option<EmployeeEmbedding>> {
        let row = sqlx::query(
            "SELECT * FROM employee_embeddings WHERE tenant = ?1 AND user_id = ?2",
        )
        .bind(tenant)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(row_to_employee))
    }

    pub async fn list_employee_embeddings(&self, tenant: &str) -> Result<Vec<EmployeeEmbedding>> {
        let rows = sqlx::query("SELECT * FROM employee_embeddings WHERE tenant = ?1")
            .bind(tenant)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(row_to_employee).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn test_upsert_is_one_per_user_and_tenant() {
        let store = test_store().await;
        store
            .upsert_employee_embedding("u1", "7", "employee_u1", "Ada, platform team")
            .await
            .unwrap();
        store
            .upsert_employee_embedding("u1", "7", "employee_u1", "Ada, infra team")
            .await
            .unwrap();
        store
            .upsert_employee_embedding("u1", "8", "employee_u1", "Ada, consulting")
            .await
            .unwrap();

        let record = store.get_employee_embedding("7", "u1").await.unwrap().unwrap();
        assert_eq!(record.profile_snapshot, "Ada, infra team");

        assert_eq!(store.list_employee_embeddings("7").await.unwrap().len(), 1);
        assert_eq!(store.list_employee_embeddings("8").await.unwrap().len(), 1);
    }
}

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{EntityStore, RepoError};
use crate::domain::{EntityPage, EntityRecord, OutboxMessage};

use super::outbox::save_outbox_in_tx;
use super::{map_sqlx_error, PostgresRepositories};

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    payload: serde_json::Value,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<EntityRow> for EntityRecord {
    fn from(row: EntityRow) -> Self {
        Self {
            id: row.id,
            payload: row.payload,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl EntityStore for PostgresRepositories {
    async fn find_entity(&self, id: &str) -> Result<Option<EntityRecord>, RepoError> {
        let row = sqlx::query_as::<_, EntityRow>(
            "SELECT id, payload, version, created_at, updated_at FROM entities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(EntityRecord::from))
    }

    async fn list_entities(&self, limit: u32, offset: u64) -> Result<EntityPage, RepoError> {
        let limit = limit.clamp(1, 200);
        let (total,): (i64,) = sqlx::query_as("SELECT count(*) FROM entities")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let rows = sqlx::query_as::<_, EntityRow>(
            "SELECT id, payload, version, created_at, updated_at \
               FROM entities \
              ORDER BY created_at DESC, id ASC \
              LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(EntityPage {
            items: rows.into_iter().map(EntityRecord::from).collect(),
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    async fn upsert_entity(
        &self,
        id: &str,
        payload: &serde_json::Value,
        outbox: &OutboxMessage,
    ) -> Result<EntityRecord, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, EntityRow>(
            "INSERT INTO entities (id, payload) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE \
                SET payload = EXCLUDED.payload, \
                    version = entities.version + 1, \
                    updated_at = now() \
             RETURNING id, payload, version, created_at, updated_at",
        )
        .bind(id)
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        save_outbox_in_tx(&mut tx, outbox).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(EntityRecord::from(row))
    }

    async fn delete_entity(&self, id: &str, outbox: &OutboxMessage) -> Result<bool, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let result = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(false);
        }

        save_outbox_in_tx(&mut tx, outbox).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }
}

//! PostgreSQL-backed metadata store.
//!
//! Documents live in a single `documents` table with a JSONB body and a
//! version column used for compare-and-swap. Equality filters compile to
//! JSONB containment so the GIN index applies; the scan order matches the
//! contract's `(created_at, id)` ordering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::common::error::{Error, Result};

use super::{check_tx_size, Document, MetadataStore, Query, TxOp};

pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_document(row: &PgRow) -> Document {
        Document {
            collection: row.get("collection"),
            id: row.get("id"),
            version: row.get("version"),
            body: row.get("body"),
            created_at: row.get("created_at"),
        }
    }

    fn backend_err(e: sqlx::Error) -> Error {
        Error::RetryableBackend(format!("postgres: {e}"))
    }

    fn build_filtered<'a>(query: &'a Query, selection: &str) -> QueryBuilder<'a, Postgres> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {selection} FROM documents WHERE collection = "));
        builder.push_bind(&query.collection);

        if !query.eq.is_empty() {
            let mut containment = serde_json::Map::new();
            for (field, value) in &query.eq {
                containment.insert(field.clone(), value.clone());
            }
            builder.push(" AND body @> ");
            builder.push_bind(serde_json::Value::Object(containment));
        }
        if let Some((field, bound)) = &query.lte_num {
            builder.push(" AND (body->>");
            builder.push_bind(field);
            builder.push(")::bigint <= ");
            builder.push_bind(*bound);
        }
        if let Some(after) = query.created_after {
            builder.push(" AND created_at > ");
            builder.push_bind(after);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND created_at < ");
            builder.push_bind(before);
        }
        if let Some((cursor_ts, cursor_id)) = &query.after {
            builder.push(" AND (created_at, id) > (");
            builder.push_bind(*cursor_ts);
            builder.push(", ");
            builder.push_bind(cursor_id);
            builder.push(")");
        }
        builder
    }
}

const DOCUMENT_COLUMNS: &str = "collection, id, version, body, created_at";

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = $1 AND id = $2"
        ))
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        Ok(row.as_ref().map(Self::row_to_document))
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<Document> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO documents (collection, id, version, body, created_at, updated_at)
            VALUES ($1, $2, 1, $3, NOW(), NOW())
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(collection)
        .bind(id)
        .bind(&body)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        match row {
            Some(row) => Ok(Self::row_to_document(&row)),
            None => Err(Error::Conflict(format!(
                "document {collection}/{id} already exists"
            ))),
        }
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: serde_json::Value,
    ) -> Result<Document> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE documents
            SET version = version + 1, body = $4, updated_at = NOW()
            WHERE collection = $1 AND id = $2 AND version = $3
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(collection)
        .bind(id)
        .bind(expected_version)
        .bind(&body)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::backend_err)?;

        match row {
            Some(row) => Ok(Self::row_to_document(&row)),
            None => Err(Error::Conflict(format!(
                "stale write on {collection}/{id}: expected version {expected_version}"
            ))),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Self::backend_err)?;
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Vec<Document>> {
        let mut builder = Self::build_filtered(&query, DOCUMENT_COLUMNS);
        builder.push(" ORDER BY created_at, id LIMIT ");
        builder.push_bind(query.limit.max(0));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Self::backend_err)?;

        Ok(rows.iter().map(Self::row_to_document).collect())
    }

    async fn count(&self, query: Query) -> Result<i64> {
        let mut builder = Self::build_filtered(&query, "COUNT(*) AS total");
        let row = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(Self::backend_err)?;
        Ok(row.get::<i64, _>("total"))
    }

    async fn transact(&self, ops: Vec<TxOp>) -> Result<()> {
        check_tx_size(&ops)?;
        let mut tx = self.pool.begin().await.map_err(Self::backend_err)?;

        for op in &ops {
            match op {
                TxOp::Insert {
                    collection,
                    id,
                    body,
                } => {
                    let inserted = sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, version, body, created_at, updated_at)
                        VALUES ($1, $2, 1, $3, NOW(), NOW())
                        ON CONFLICT (collection, id) DO NOTHING
                        "#,
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(body)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::backend_err)?;

                    if inserted.rows_affected() == 0 {
                        return Err(Error::Conflict(format!(
                            "document {collection}/{id} already exists"
                        )));
                    }
                }
                TxOp::Put {
                    collection,
                    id,
                    expected_version,
                    body,
                } => {
                    let updated = sqlx::query(
                        r#"
                        UPDATE documents
                        SET version = version + 1, body = $4, updated_at = NOW()
                        WHERE collection = $1 AND id = $2 AND version = $3
                        "#,
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(expected_version)
                    .bind(body)
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::backend_err)?;

                    if updated.rows_affected() == 0 {
                        return Err(Error::Conflict(format!(
                            "stale write on {collection}/{id}: expected version {expected_version}"
                        )));
                    }
                }
                TxOp::Delete { collection, id } => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(Self::backend_err)?;
                }
            }
        }

        tx.commit().await.map_err(Self::backend_err)?;
        Ok(())
    }
}

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{Document, DocumentStore, Filter, OrderBy, Query, StoreError};

/// Document store over a single `documents` table with a JSONB body.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn select_query<'a>(collection: &'a str, query: &'a Query) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT id, data, created_at FROM documents WHERE collection = ");
    qb.push_bind(collection);

    for filter in &query.filters {
        match filter {
            Filter::Eq { field, value } => {
                qb.push(" AND data -> ");
                qb.push_bind(field.as_str());
                qb.push(" = ");
                qb.push_bind(Json(value.clone()));
            }
            Filter::ArrayContains { field, value } => {
                qb.push(" AND data -> ");
                qb.push_bind(field.as_str());
                qb.push(" @> ");
                qb.push_bind(Json(Value::Array(vec![value.clone()])));
            }
        }
    }

    match &query.order_by {
        Some(OrderBy::CreatedAt(direction)) => {
            qb.push(format!(
                " ORDER BY created_at {dir}, seq {dir}",
                dir = direction.sql()
            ));
        }
        Some(OrderBy::Field(field, direction)) => {
            qb.push(" ORDER BY data -> ");
            qb.push_bind(field.as_str());
            qb.push(format!(" {}, seq {}", direction.sql(), direction.sql()));
        }
        None => {
            qb.push(" ORDER BY seq ASC");
        }
    }

    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    qb
}

fn row_to_document(row: &PgRow) -> Result<Document, StoreError> {
    let id: String = row.try_get("id")?;
    let data: Json<Value> = row.try_get("data")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Document {
        id,
        created_at,
        data: data.0,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, data, created_at
              FROM documents
             WHERE collection = $1
               AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut qb = select_query(collection, query);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn insert(&self, collection: &str, data: Value) -> Result<Document, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let row = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data)
            VALUES ($1, $2, $3)
            RETURNING created_at
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(Json(data.clone()))
        .fetch_one(&self.pool)
        .await?;
        Ok(Document {
            id,
            created_at: row.try_get("created_at")?,
            data,
        })
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents
               SET data = data || $3
             WHERE collection = $1
               AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(Value::Object(fields)))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

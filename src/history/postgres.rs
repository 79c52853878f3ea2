use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{HistoryStore, SearchRecord};
use crate::search::SearchType;

#[derive(Debug)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn record(&self, record: SearchRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO search_history
                (id, session_id, user_id, query, search_type, category, country, result_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(record.id)
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.query)
        .bind(record.search_type.as_str())
        .bind(&record.category)
        .bind(&record.country)
        .bind(i32::try_from(record.result_count).unwrap_or(i32::MAX))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SearchRecord>> {
        let rows = sqlx::query(
            r"
            SELECT id, session_id, user_id, query, search_type, category, country, result_count, created_at
            FROM search_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(user_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let search_type: String = row.try_get("search_type")?;
            let result_count: i32 = row.try_get("result_count")?;
            records.push(SearchRecord {
                id: row.try_get("id")?,
                session_id: row.try_get("session_id")?,
                user_id: row.try_get("user_id")?,
                query: row.try_get("query")?,
                search_type: SearchType::parse(&search_type),
                category: row.try_get("category")?,
                country: row.try_get("country")?,
                result_count: usize::try_from(result_count).unwrap_or(0),
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(records)
    }
}

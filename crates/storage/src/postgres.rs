//! Postgres catalog. Every write is an upsert keyed by fingerprint, so
//! replaying a crawl converges to the same rows.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use trawler_core::{CrawlError, Extracted};

use crate::{Catalog, CrawlMeta};

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self, CrawlError> {
        Self::with_pool_size(database_url, 20).await
    }

    pub async fn with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, CrawlError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        info!(max_connections, "connected to postgres catalog");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), CrawlError> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        info!("catalog migrations complete");
        Ok(())
    }

    fn db_err(e: sqlx::Error) -> CrawlError {
        CrawlError::Storage(e.to_string())
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn record_crawl(&self, fingerprint: &str, meta: &CrawlMeta) -> Result<(), CrawlError> {
        sqlx::query(
            r#"INSERT INTO crawled_pages
                   (fingerprint, job_id, url, final_url, status, content_type, size, depth, fetched_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (fingerprint) DO UPDATE SET
                   status = EXCLUDED.status,
                   final_url = EXCLUDED.final_url,
                   content_type = EXCLUDED.content_type,
                   size = EXCLUDED.size,
                   fetched_at = EXCLUDED.fetched_at,
                   last_seen_at = now()"#,
        )
        .bind(fingerprint)
        .bind(&meta.job_id)
        .bind(&meta.url)
        .bind(&meta.final_url)
        .bind(meta.status as i32)
        .bind(&meta.content_type)
        .bind(meta.size as i64)
        .bind(meta.depth as i32)
        .bind(meta.fetched_at)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn record_extract(
        &self,
        fingerprint: &str,
        extracted: &Extracted,
    ) -> Result<(), CrawlError> {
        let links = serde_json::to_value(&extracted.links)
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO extracts (fingerprint, title, meta_description, language, links)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (fingerprint) DO UPDATE SET
                   title = EXCLUDED.title,
                   meta_description = EXCLUDED.meta_description,
                   language = EXCLUDED.language,
                   links = EXCLUDED.links,
                   extracted_at = now()"#,
        )
        .bind(fingerprint)
        .bind(&extracted.title)
        .bind(&extracted.meta_description)
        .bind(&extracted.language)
        .bind(links)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn update_validators(
        &self,
        fingerprint: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            r#"INSERT INTO conditional_validators (fingerprint, etag, last_modified)
               VALUES ($1, $2, $3)
               ON CONFLICT (fingerprint) DO UPDATE SET
                   etag = EXCLUDED.etag,
                   last_modified = EXCLUDED.last_modified,
                   updated_at = now()"#,
        )
        .bind(fingerprint)
        .bind(etag)
        .bind(last_modified)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }

    async fn record_failure(&self, fingerprint: &str, reason: &str) -> Result<(), CrawlError> {
        sqlx::query(
            r#"INSERT INTO crawl_failures (fingerprint, reason)
               VALUES ($1, $2)
               ON CONFLICT (fingerprint) DO UPDATE SET
                   reason = EXCLUDED.reason,
                   failed_at = now()"#,
        )
        .bind(fingerprint)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;
        Ok(())
    }
}

//! Durability log of scrape runs in Postgres.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rfps_core::Opportunity;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub source: String,
    pub run_date: DateTime<Utc>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub total_records: i64,
    pub artifact_path: Option<String>,
    pub artifact_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrapeRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub opportunity_run_id: Uuid,
    pub notice_id: String,
    pub posted_date: String,
    pub payload: serde_json::Value,
}

impl ScrapeRecord {
    pub fn from_opportunity(run_id: Uuid, opportunity: &Opportunity, now: DateTime<Utc>) -> Result<Self> {
        let payload = serde_json::to_value(opportunity)
            .with_context(|| format!("serializing opportunity {}", opportunity.notice_id))?;
        Ok(Self {
            id: Uuid::now_v7(),
            created_at: now,
            last_updated: now,
            opportunity_run_id: run_id,
            notice_id: opportunity.notice_id.clone(),
            posted_date: opportunity.posted_date.clone(),
            payload,
        })
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &RunRecord) -> Result<()>;
    async fn create_scrapes(&self, scrapes: &[ScrapeRecord]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunity_run (
                id, created_at, last_updated, source, run_date,
                window_start, window_end, total_records, artifact_path, artifact_sha256
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.id)
        .bind(run.created_at)
        .bind(run.last_updated)
        .bind(&run.source)
        .bind(run.run_date)
        .bind(run.window_start)
        .bind(run.window_end)
        .bind(run.total_records)
        .bind(&run.artifact_path)
        .bind(&run.artifact_sha256)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting opportunity_run {}", run.id))?;
        Ok(())
    }

    async fn create_scrapes(&self, scrapes: &[ScrapeRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        for scrape in scrapes {
            sqlx::query(
                r#"
                INSERT INTO opportunity_scrapes (
                    id, created_at, last_updated, opportunity_run_id,
                    notice_id, posted_date, payload
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(scrape.id)
            .bind(scrape.created_at)
            .bind(scrape.last_updated)
            .bind(scrape.opportunity_run_id)
            .bind(&scrape.notice_id)
            .bind(&scrape.posted_date)
            .bind(&scrape.payload)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting scrape for notice {}", scrape.notice_id))?;
        }
        tx.commit().await.context("committing scrapes")?;
        Ok(())
    }
}

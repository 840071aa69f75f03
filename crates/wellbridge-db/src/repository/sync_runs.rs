//! # Sync Run Repository
//!
//! One row per finished sync phase. The orchestrator writes a summary when a
//! phase completes (even with failed batches); the CLI and the connection
//! bloc read the latest one back after a restart.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use wellbridge_core::progress::{SyncPhase, SyncSummary};

/// A stored sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRunRecord {
    pub id: String,
    pub summary: SyncSummary,
}

#[derive(sqlx::FromRow)]
struct SyncRunRow {
    id: String,
    phase: String,
    total_points: i64,
    successful: i64,
    failed: i64,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl TryFrom<SyncRunRow> for SyncRunRecord {
    type Error = DbError;

    fn try_from(row: SyncRunRow) -> Result<Self, Self::Error> {
        let phase: SyncPhase = row
            .phase
            .parse()
            .map_err(|e: wellbridge_core::ValidationError| DbError::corrupt(&row.id, e.to_string()))?;

        Ok(SyncRunRecord {
            id: row.id,
            summary: SyncSummary {
                phase,
                total_data_points: row.total_points.max(0) as u64,
                successful_uploads: row.successful.max(0) as u64,
                failed_uploads: row.failed.max(0) as u64,
                started_at: row.started_at,
                completed_at: row.completed_at,
            },
        })
    }
}

/// Repository for the `sync_runs` table.
#[derive(Debug, Clone)]
pub struct SyncRunRepository {
    pool: SqlitePool,
}

impl SyncRunRepository {
    /// Creates a new SyncRunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncRunRepository { pool }
    }

    /// Stores a finished phase and returns its id.
    pub async fn record(&self, summary: &SyncSummary) -> DbResult<String> {
        let id = Uuid::new_v4().to_string();

        debug!(
            run_id = %id,
            phase = %summary.phase,
            successful = summary.successful_uploads,
            failed = summary.failed_uploads,
            "Recording sync run"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                id, phase, total_points, successful, failed, started_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(summary.phase.to_string())
        .bind(summary.total_data_points as i64)
        .bind(summary.successful_uploads as i64)
        .bind(summary.failed_uploads as i64)
        .bind(summary.started_at)
        .bind(summary.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Most recent run of a phase.
    pub async fn latest(&self, phase: SyncPhase) -> DbResult<Option<SyncRunRecord>> {
        let row: Option<SyncRunRow> = sqlx::query_as(
            r#"
            SELECT id, phase, total_points, successful, failed, started_at, completed_at
            FROM sync_runs
            WHERE phase = ?1
            ORDER BY completed_at DESC
            LIMIT 1
            "#,
        )
        .bind(phase.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncRunRecord::try_from).transpose()
    }

    /// Most recent runs across phases, newest first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncRunRecord>> {
        let rows: Vec<SyncRunRow> = sqlx::query_as(
            r#"
            SELECT id, phase, total_points, successful, failed, started_at, completed_at
            FROM sync_runs
            ORDER BY completed_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncRunRecord::try_from).collect()
    }

    /// Fetches one run by id.
    pub async fn get(&self, id: &str) -> DbResult<SyncRunRecord> {
        let row: Option<SyncRunRow> = sqlx::query_as(
            r#"
            SELECT id, phase, total_points, successful, failed, started_at, completed_at
            FROM sync_runs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| DbError::not_found("SyncRun", id))?
            .try_into()
    }

    /// Removes all history (used on disconnect).
    pub async fn clear(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_runs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::{Duration, TimeZone};

    fn summary(phase: SyncPhase, minute: u32, failed: u64) -> SyncSummary {
        let started = Utc.with_ymd_and_hms(2026, 5, 4, 9, minute, 0).unwrap();
        SyncSummary {
            phase,
            total_data_points: 100,
            successful_uploads: 100 - failed,
            failed_uploads: failed,
            started_at: started,
            completed_at: started + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_record_and_latest() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.sync_runs();

        runs.record(&summary(SyncPhase::BodyPrep, 1, 0)).await.unwrap();
        let id = runs
            .record(&summary(SyncPhase::BodyPrep, 5, 10))
            .await
            .unwrap();
        runs.record(&summary(SyncPhase::DigitalTwin, 3, 0)).await.unwrap();

        let latest = runs.latest(SyncPhase::BodyPrep).await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.summary.failed_uploads, 10);

        let recent = runs.recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, id);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db.sync_runs().get("nope").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_clear() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let runs = db.sync_runs();
        runs.record(&summary(SyncPhase::DigitalTwin, 1, 0)).await.unwrap();
        assert_eq!(runs.clear().await.unwrap(), 1);
        assert!(runs.latest(SyncPhase::DigitalTwin).await.unwrap().is_none());
    }
}

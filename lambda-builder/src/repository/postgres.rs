//! PostgreSQL job store
//!
//! One row per build in `build_jobs`; the request id is unique so a
//! redelivered event can never create a second row. A partial unique index
//! keeps at most one active row per key, and updates never touch a row that
//! is already terminal, so instances sharing the table cannot overwrite
//! each other's outcomes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use lambda_core::domain::{BuildJob, BuildKey, BuildRequest, BuildStatus, ErrorKind, ImageRef, StageAttempts};

use super::{JobStore, StoreRepoError};
use crate::db::ACTIVE_KEY_INDEX;

const SELECT_COLUMNS: &str = r#"
    SELECT job_id, request_id, tenant_id, parser_id, status, error_kind, error_message,
           image_repository, image_tag, image_digest, attempts,
           received_at, started_at, finished_at
    FROM build_jobs
"#;

pub struct PgJobStore {
    pool: PgPool,
    /// Lease owner of the rows this process records
    owner: String,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            owner: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        let row = BuildJobRow::from(job);

        let result = sqlx::query(
            r#"
            INSERT INTO build_jobs (job_id, request_id, tenant_id, parser_id, status, error_kind,
                                    error_message, image_repository, image_tag, image_digest,
                                    attempts, received_at, started_at, finished_at, owner,
                                    lease_renewed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(row.job_id)
        .bind(&row.request_id)
        .bind(&row.tenant_id)
        .bind(&row.parser_id)
        .bind(&row.status)
        .bind(&row.error_kind)
        .bind(&row.error_message)
        .bind(&row.image_repository)
        .bind(&row.image_tag)
        .bind(&row.image_digest)
        .bind(&row.attempts)
        .bind(row.received_at)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreRepoError::Conflict(row.request_id));
        }
        Ok(())
    }

    async fn update(&self, job: &BuildJob) -> Result<(), StoreRepoError> {
        let row = BuildJobRow::from(job);

        let result = sqlx::query(
            r#"
            UPDATE build_jobs
            SET status = $1, error_kind = $2, error_message = $3, image_repository = $4,
                image_tag = $5, image_digest = $6, attempts = $7, started_at = $8,
                finished_at = $9, lease_renewed_at = now()
            WHERE job_id = $10 AND status NOT IN ('Completed', 'Failed')
            "#,
        )
        .bind(&row.status)
        .bind(&row.error_kind)
        .bind(&row.error_message)
        .bind(&row.image_repository)
        .bind(&row.image_tag)
        .bind(&row.image_digest)
        .bind(&row.attempts)
        .bind(row.started_at)
        .bind(row.finished_at)
        .bind(row.job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| update_error(e, job))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let stored = sqlx::query_scalar::<_, String>("SELECT status FROM build_jobs WHERE job_id = $1")
            .bind(row.job_id)
            .fetch_optional(&self.pool)
            .await?;
        match stored {
            Some(_) => Err(StoreRepoError::Settled(row.request_id)),
            None => Err(StoreRepoError::NotFound(row.job_id.to_string())),
        }
    }

    async fn find_by_request(&self, request_id: &str) -> Result<Option<BuildJob>, StoreRepoError> {
        let row = sqlx::query_as::<_, BuildJobRow>(&format!(
            "{} WHERE request_id = $1",
            SELECT_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BuildJobRow::into_job).transpose()
    }

    async fn find_active_by_key(&self, key: &BuildKey) -> Result<Option<BuildJob>, StoreRepoError> {
        let row = sqlx::query_as::<_, BuildJobRow>(&format!(
            "{} WHERE tenant_id = $1 AND parser_id = $2 \
             AND status IN ('Assembling', 'Building', 'Publishing') \
             ORDER BY received_at ASC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(&key.tenant_id)
        .bind(&key.parser_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BuildJobRow::into_job).transpose()
    }

    async fn renew_leases(&self, at: DateTime<Utc>) -> Result<u64, StoreRepoError> {
        let result = sqlx::query(
            "UPDATE build_jobs SET lease_renewed_at = $1 \
             WHERE owner = $2 AND status NOT IN ('Completed', 'Failed')",
        )
        .bind(at)
        .bind(&self.owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_orphaned(&self, stale_before: DateTime<Utc>) -> Result<Vec<BuildJob>, StoreRepoError> {
        let rows = sqlx::query_as::<_, BuildJobRow>(&format!(
            "{} WHERE status NOT IN ('Completed', 'Failed') \
             AND owner <> $1 AND lease_renewed_at < $2 \
             ORDER BY received_at ASC",
            SELECT_COLUMNS
        ))
        .bind(&self.owner)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BuildJobRow::into_job).collect()
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreRepoError> {
        let result = sqlx::query("DELETE FROM build_jobs WHERE finished_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// A write refused by the active-key index means another build holds the key
fn update_error(e: sqlx::Error, job: &BuildJob) -> StoreRepoError {
    if let sqlx::Error::Database(db) = &e {
        if db.constraint() == Some(ACTIVE_KEY_INDEX) {
            return StoreRepoError::KeyBusy(job.key().to_string());
        }
    }
    StoreRepoError::Database(e)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct BuildJobRow {
    job_id: Uuid,
    request_id: String,
    tenant_id: String,
    parser_id: String,
    status: String,
    error_kind: Option<String>,
    error_message: Option<String>,
    image_repository: Option<String>,
    image_tag: Option<String>,
    image_digest: Option<String>,
    attempts: serde_json::Value,
    received_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<&BuildJob> for BuildJobRow {
    fn from(job: &BuildJob) -> Self {
        let (error_kind, error_message) = match &job.status {
            BuildStatus::Failed {
                error_kind,
                message,
            } => (Some(error_kind.as_str().to_string()), Some(message.clone())),
            _ => (None, None),
        };
        let image = job.status.image();

        Self {
            job_id: job.job_id,
            request_id: job.request.request_id.clone(),
            tenant_id: job.request.tenant_id.clone(),
            parser_id: job.request.parser_id.clone(),
            status: job.status.name().to_string(),
            error_kind,
            error_message,
            image_repository: image.map(|i| i.repository.clone()),
            image_tag: image.map(|i| i.tag.clone()),
            image_digest: image.and_then(|i| i.digest.clone()),
            attempts: serde_json::json!({
                "assembling": job.attempts.assembling,
                "building": job.attempts.building,
                "publishing": job.attempts.publishing,
            }),
            received_at: job.request.received_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

impl BuildJobRow {
    fn into_job(self) -> Result<BuildJob, StoreRepoError> {
        let corrupt = |reason: &str| StoreRepoError::Corrupt {
            job_id: self.job_id.to_string(),
            reason: reason.to_string(),
        };

        let status = match self.status.as_str() {
            "Received" => BuildStatus::Received,
            "Assembling" => BuildStatus::Assembling,
            "Building" => BuildStatus::Building,
            "Publishing" => BuildStatus::Publishing,
            "Completed" => {
                let (Some(repository), Some(tag)) = (&self.image_repository, &self.image_tag) else {
                    return Err(corrupt("completed build without image"));
                };
                let mut image = ImageRef::new(repository.clone(), tag.clone());
                image.digest = self.image_digest.clone();
                BuildStatus::Completed { image }
            }
            "Failed" => {
                let error_kind = self
                    .error_kind
                    .as_deref()
                    .and_then(ErrorKind::parse)
                    .ok_or_else(|| corrupt("failed build without known error kind"))?;
                BuildStatus::Failed {
                    error_kind,
                    message: self.error_message.clone().unwrap_or_default(),
                }
            }
            other => return Err(corrupt(&format!("unknown status '{}'", other))),
        };

        let attempts: StageAttempts = serde_json::from_value(self.attempts.clone())
            .map_err(|e| corrupt(&format!("bad attempts: {}", e)))?;

        Ok(BuildJob {
            job_id: self.job_id,
            request: BuildRequest {
                request_id: self.request_id,
                tenant_id: self.tenant_id,
                parser_id: self.parser_id,
                received_at: self.received_at,
            },
            status,
            attempts,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

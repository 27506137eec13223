use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// Unique index allowing one active build per key
pub(crate) const ACTIVE_KEY_INDEX: &str = "uq_build_jobs_active_key";

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_jobs (
            job_id UUID PRIMARY KEY,
            request_id VARCHAR(256) NOT NULL UNIQUE,
            tenant_id VARCHAR(128) NOT NULL,
            parser_id VARCHAR(128) NOT NULL,
            status VARCHAR(32) NOT NULL,
            error_kind VARCHAR(32),
            error_message TEXT,
            image_repository TEXT,
            image_tag VARCHAR(128),
            image_digest VARCHAR(128),
            attempts JSONB NOT NULL DEFAULT '{}',
            received_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            owner VARCHAR(64) NOT NULL DEFAULT '',
            lease_renewed_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tables created before build leases existed
    sqlx::query(
        "ALTER TABLE build_jobs \
         ADD COLUMN IF NOT EXISTS owner VARCHAR(64) NOT NULL DEFAULT '', \
         ADD COLUMN IF NOT EXISTS lease_renewed_at TIMESTAMPTZ NOT NULL DEFAULT now()",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_build_jobs_key_status ON build_jobs(tenant_id, parser_id, status)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_jobs_finished_at ON build_jobs(finished_at)")
        .execute(pool)
        .await?;

    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON build_jobs(tenant_id, parser_id) \
         WHERE status IN ('Assembling', 'Building', 'Publishing')",
        ACTIVE_KEY_INDEX
    ))
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_jobs_owner ON build_jobs(owner, lease_renewed_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

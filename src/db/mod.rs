mod models;

pub use models::*;

use crate::error::{LedgerError, SelectionError};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub type DbPool = Arc<PgPool>;

/// Advisory lock key guarding batch runs against overlapping scheduler fires.
const RUN_LOCK_KEY: i64 = 0x6365_7274_6966_6130;

pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    Ok(Arc::new(pool))
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn select_pending(
        &self,
        minimum_grade: i32,
        max_attempts: i32,
    ) -> Result<Vec<Candidate>, SelectionError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// True if a non-error record exists for the pair.
    async fn record_exists(&self, student_id: i64, course_id: i64) -> Result<bool, LedgerError>;
    async fn mark_processing(&self, candidate: &Candidate) -> Result<(), LedgerError>;
    async fn mark_completed(
        &self,
        student_id: i64,
        course_id: i64,
        unique_code: &str,
        drive_link: &str,
    ) -> Result<(), LedgerError>;
    async fn mark_error(
        &self,
        student_id: i64,
        course_id: i64,
        message: &str,
    ) -> Result<(), LedgerError>;
}

/// Best attempt per (student, course) above the grade threshold, excluding
/// pairs with an active ledger row or an exhausted retry budget.
const SELECT_PENDING_SQL: &str = r#"
SELECT DISTINCT ON (a.student_id, a.course_id)
       a.student_id,
       s.full_name,
       s.dni,
       a.course_id,
       c.name AS course_name,
       a.grade,
       a.attempt_date
FROM assessment_attempts a
JOIN students s ON s.id = a.student_id
JOIN courses c ON c.id = a.course_id
WHERE a.grade >= $1
  AND NOT EXISTS (
      SELECT 1
      FROM certificates g
      WHERE g.student_id = a.student_id
        AND g.course_id = a.course_id
        AND (g.status <> 'error' OR g.attempts >= $2)
  )
ORDER BY a.student_id, a.course_id, a.grade DESC
"#;

pub struct PgCandidateSource {
    pool: DbPool,
}

impl PgCandidateSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSource for PgCandidateSource {
    async fn select_pending(
        &self,
        minimum_grade: i32,
        max_attempts: i32,
    ) -> Result<Vec<Candidate>, SelectionError> {
        let rows = sqlx::query_as::<_, Candidate>(SELECT_PENDING_SQL)
            .bind(f64::from(minimum_grade))
            .bind(max_attempts)
            .fetch_all(self.pool.as_ref())
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for candidate in rows {
            if candidate.full_name.trim().is_empty() || candidate.course_name.trim().is_empty() {
                warn!(
                    student_id = candidate.student_id,
                    course_id = candidate.course_id,
                    "skipping malformed candidate row"
                );
                continue;
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }
}

pub struct PgLedger {
    pool: DbPool,
    issuer: String,
}

impl PgLedger {
    pub fn new(pool: DbPool, issuer: impl Into<String>) -> Self {
        Self {
            pool,
            issuer: issuer.into(),
        }
    }
}

fn map_write_error(err: sqlx::Error, student_id: i64, course_id: i64) -> LedgerError {
    let unique_violation = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if unique_violation {
        LedgerError::Conflict {
            student_id,
            course_id,
        }
    } else {
        err.into()
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn record_exists(&self, student_id: i64, course_id: i64) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM certificates \
             WHERE student_id = $1 AND course_id = $2 AND status <> 'error')",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(exists)
    }

    async fn mark_processing(&self, candidate: &Candidate) -> Result<(), LedgerError> {
        // Resume the newest error row for the pair, if any; the partial unique
        // index rejects the transition when an active row already exists.
        let resumed = sqlx::query(
            r#"
            UPDATE certificates
            SET status = 'processing',
                attempts = attempts + 1,
                error_message = NULL,
                dni = $3,
                full_name = $4,
                course_name = $5,
                grade = $6,
                issuer = $7
            WHERE id = (
                SELECT id FROM certificates
                WHERE student_id = $1 AND course_id = $2 AND status = 'error'
                ORDER BY id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(candidate.student_id)
        .bind(candidate.course_id)
        .bind(&candidate.dni)
        .bind(&candidate.full_name)
        .bind(&candidate.course_name)
        .bind(candidate.grade)
        .bind(&self.issuer)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| map_write_error(e, candidate.student_id, candidate.course_id))?;

        if resumed.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO certificates
                (student_id, course_id, dni, full_name, course_name, grade, issuer, status, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'processing', 1)
            "#,
        )
        .bind(candidate.student_id)
        .bind(candidate.course_id)
        .bind(&candidate.dni)
        .bind(&candidate.full_name)
        .bind(&candidate.course_name)
        .bind(candidate.grade)
        .bind(&self.issuer)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| map_write_error(e, candidate.student_id, candidate.course_id))?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        student_id: i64,
        course_id: i64,
        unique_code: &str,
        drive_link: &str,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE certificates
            SET status = 'completed',
                unique_code = $3,
                drive_link = $4,
                issued_date = CURRENT_DATE
            WHERE student_id = $1 AND course_id = $2 AND status = 'processing'
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .bind(unique_code)
        .bind(drive_link)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            warn!(student_id, course_id, "no processing row found to complete");
        }
        Ok(())
    }

    async fn mark_error(
        &self,
        student_id: i64,
        course_id: i64,
        message: &str,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE certificates
            SET status = 'error',
                error_message = $3
            WHERE student_id = $1 AND course_id = $2 AND status = 'processing'
            "#,
        )
        .bind(student_id)
        .bind(course_id)
        .bind(message)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            warn!(student_id, course_id, "no processing row found to mark as error");
        }
        Ok(())
    }
}

/// Public verification lookup by the code printed on the certificate.
pub async fn find_by_code(
    pool: &PgPool,
    unique_code: &str,
) -> Result<Option<CertificateRecord>, sqlx::Error> {
    sqlx::query_as::<_, CertificateRecord>("SELECT * FROM certificates WHERE unique_code = $1")
        .bind(unique_code)
        .fetch_optional(pool)
        .await
}

/// Holds the batch advisory lock on its own connection. The session owns the
/// lock, so dropping the detached connection also releases it if `release`
/// is never reached.
pub struct RunLock {
    conn: PgConnection,
}

pub async fn try_run_lock(pool: &PgPool) -> Result<Option<RunLock>, sqlx::Error> {
    let mut conn = pool.acquire().await?.detach();
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(RUN_LOCK_KEY)
        .fetch_one(&mut conn)
        .await?;
    if locked {
        Ok(Some(RunLock { conn }))
    } else {
        let _ = conn.close().await;
        Ok(None)
    }
}

impl RunLock {
    pub async fn release(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .execute(&mut self.conn)
            .await?;
        self.conn.close().await
    }
}

/// Rows stuck in `processing` (a crashed or aborted run) re-enter the retry
/// path as errors once they are older than `max_age`.
pub async fn reset_stale_processing(
    pool: &PgPool,
    max_age: Duration,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE certificates
        SET status = 'error',
            error_message = 'stale processing entry from an aborted run'
        WHERE status = 'processing'
          AND updated_at < now() - make_interval(secs => $1)
        "#,
    )
    .bind(max_age.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

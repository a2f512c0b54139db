use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "certificate_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One row per certificate attempt for a (student, course) pair.
#[derive(Debug, FromRow, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub dni: Option<String>,
    pub full_name: String,
    pub course_name: String,
    pub grade: Option<f64>,
    pub unique_code: Option<String>,
    pub issued_date: Option<NaiveDate>,
    pub issuer: Option<String>,
    pub drive_link: Option<String>,
    pub status: CertificateStatus,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Join projection of the host's student, course, and assessment data.
/// Produced fresh each run, never persisted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Candidate {
    pub student_id: i64,
    pub full_name: String,
    pub dni: Option<String>,
    pub course_id: i64,
    pub course_name: String,
    pub grade: f64,
    pub attempt_date: Option<DateTime<Utc>>,
}

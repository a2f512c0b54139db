use thiserror::Error;

/// The candidate query failed outright. Aborts the whole batch; nothing is
/// processed and nothing is written.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("candidate query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("an active certificate already exists for student {student_id} in course {course_id}")]
    Conflict { student_id: i64, course_id: i64 },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("font {name}: {reason}")]
    Font { name: String, reason: String },
    #[error("text field '{field}' does not fit the page")]
    Overflow { field: &'static str },
    #[error("verification code: {0}")]
    Code(String),
    #[error("pdf assembly: {0}")]
    Pdf(String),
    #[error("signature: {0}")]
    Signature(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("drive auth: {0}")]
    Auth(String),
    #[error("drive request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("drive api returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_variant_format() {
        let err = LedgerError::Conflict {
            student_id: 7,
            course_id: 9,
        };
        assert_eq!(
            err.to_string(),
            "an active certificate already exists for student 7 in course 9"
        );
    }

    #[test]
    fn overflow_variant_format() {
        let err = RenderError::Overflow { field: "full_name" };
        assert_eq!(err.to_string(), "text field 'full_name' does not fit the page");
    }

    #[test]
    fn signature_variant_format() {
        let err = RenderError::Signature("bad key".into());
        assert_eq!(err.to_string(), "signature: bad key");
    }

    #[test]
    fn api_variant_format() {
        let err = PublishError::Api {
            status: 403,
            body: "quota exceeded".into(),
        };
        assert_eq!(err.to_string(), "drive api returned 403: quota exceeded");
    }

    #[test]
    fn auth_variant_format() {
        let err = PublishError::Auth("token endpoint unreachable".into());
        assert_eq!(err.to_string(), "drive auth: token endpoint unreachable");
    }
}

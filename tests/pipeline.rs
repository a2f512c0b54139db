use async_trait::async_trait;
use certifica::config::{Config, PdfSettings, SignatureConfig, SignerInfo};
use certifica::db::{Candidate, CandidateSource, Ledger};
use certifica::drive::Publish;
use certifica::error::{LedgerError, PublishError, RenderError, SelectionError};
use certifica::pipeline::{run_batch, BatchReport};
use certifica::render::{Render, RenderedCertificate};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        root_folder_id: "root".into(),
        templates_path: PathBuf::from("templates"),
        fonts_path: PathBuf::from("assets/fonts"),
        credentials_path: PathBuf::from("credentials.json"),
        minimum_grade: 15,
        max_attempts: 5,
        run_interval_secs: 3600,
        pdf: PdfSettings {
            orientation: "L".into(),
            unit: "mm".into(),
            format: "A4".into(),
        },
        signature: SignatureConfig {
            cert_path: PathBuf::from("public.crt"),
            key_path: PathBuf::from("private.key"),
            password: String::new(),
            info: SignerInfo {
                name: "Test Issuer".into(),
                location: String::new(),
                reason: String::new(),
                contact: String::new(),
            },
        },
    }
}

fn candidate(student_id: i64, course_id: i64) -> Candidate {
    Candidate {
        student_id,
        full_name: format!("Student {student_id}"),
        dni: Some("12345678".into()),
        course_id,
        course_name: "Seguridad Industrial".into(),
        grade: 18.0,
        attempt_date: None,
    }
}

struct StaticSource {
    candidates: Vec<Candidate>,
}

#[async_trait]
impl CandidateSource for StaticSource {
    async fn select_pending(
        &self,
        _minimum_grade: i32,
        _max_attempts: i32,
    ) -> Result<Vec<Candidate>, SelectionError> {
        Ok(self.candidates.clone())
    }
}

struct FailingSource;

#[async_trait]
impl CandidateSource for FailingSource {
    async fn select_pending(
        &self,
        _minimum_grade: i32,
        _max_attempts: i32,
    ) -> Result<Vec<Candidate>, SelectionError> {
        Err(SelectionError::Database(sqlx::Error::PoolClosed))
    }
}

#[derive(Default)]
struct MemoryLedger {
    statuses: Mutex<HashMap<(i64, i64), String>>,
    completed: Mutex<Vec<(i64, i64, String, String)>>,
    errors: Mutex<Vec<(i64, i64, String)>>,
    conflict_pairs: HashSet<(i64, i64)>,
}

impl MemoryLedger {
    fn with_conflict(student_id: i64, course_id: i64) -> Self {
        Self {
            conflict_pairs: HashSet::from([(student_id, course_id)]),
            ..Default::default()
        }
    }

    fn status_of(&self, student_id: i64, course_id: i64) -> Option<String> {
        self.statuses
            .lock()
            .unwrap()
            .get(&(student_id, course_id))
            .cloned()
    }

    fn write_count(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_exists(&self, student_id: i64, course_id: i64) -> Result<bool, LedgerError> {
        let statuses = self.statuses.lock().unwrap();
        Ok(statuses
            .get(&(student_id, course_id))
            .is_some_and(|s| s != "error"))
    }

    async fn mark_processing(&self, candidate: &Candidate) -> Result<(), LedgerError> {
        let key = (candidate.student_id, candidate.course_id);
        if self.conflict_pairs.contains(&key) {
            return Err(LedgerError::Conflict {
                student_id: key.0,
                course_id: key.1,
            });
        }
        self.statuses.lock().unwrap().insert(key, "processing".into());
        Ok(())
    }

    async fn mark_completed(
        &self,
        student_id: i64,
        course_id: i64,
        unique_code: &str,
        drive_link: &str,
    ) -> Result<(), LedgerError> {
        self.statuses
            .lock()
            .unwrap()
            .insert((student_id, course_id), "completed".into());
        self.completed.lock().unwrap().push((
            student_id,
            course_id,
            unique_code.to_string(),
            drive_link.to_string(),
        ));
        Ok(())
    }

    async fn mark_error(
        &self,
        student_id: i64,
        course_id: i64,
        message: &str,
    ) -> Result<(), LedgerError> {
        self.statuses
            .lock()
            .unwrap()
            .insert((student_id, course_id), "error".into());
        self.errors
            .lock()
            .unwrap()
            .push((student_id, course_id, message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MockRenderer {
    fail_students: HashSet<i64>,
    calls: AtomicUsize,
}

impl MockRenderer {
    fn failing_for(student_id: i64) -> Self {
        Self {
            fail_students: HashSet::from([student_id]),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Render for MockRenderer {
    async fn render(&self, candidate: &Candidate) -> Result<RenderedCertificate, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_students.contains(&candidate.student_id) {
            return Err(RenderError::Pdf("template raster failed".into()));
        }
        Ok(RenderedCertificate {
            certificate_id: format!("code-{}", candidate.student_id),
            pdf: b"%PDF-1.4 test".to_vec(),
        })
    }
}

#[derive(Default)]
struct MockPublisher {
    fail: bool,
}

#[async_trait]
impl Publish for MockPublisher {
    async fn publish(
        &self,
        _rendered: &RenderedCertificate,
        candidate: &Candidate,
    ) -> Result<String, PublishError> {
        if self.fail {
            return Err(PublishError::Api {
                status: 403,
                body: "quota exceeded".into(),
            });
        }
        Ok(format!(
            "https://drive.google.com/uc?export=download&id=file-{}",
            candidate.student_id
        ))
    }
}

#[tokio::test]
async fn empty_batch_is_not_an_error() {
    let report = run_batch(
        &test_config(),
        &StaticSource { candidates: vec![] },
        &MemoryLedger::default(),
        &MockRenderer::default(),
        &MockPublisher::default(),
    )
    .await
    .unwrap();

    assert_eq!(report, BatchReport::default());
}

#[tokio::test]
async fn selection_failure_aborts_with_nothing_processed() {
    let ledger = MemoryLedger::default();
    let renderer = MockRenderer::default();

    let result = run_batch(
        &test_config(),
        &FailingSource,
        &ledger,
        &renderer,
        &MockPublisher::default(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(ledger.write_count(), 0);
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn render_failure_is_isolated_to_one_candidate() {
    let ledger = MemoryLedger::default();
    let report = run_batch(
        &test_config(),
        &StaticSource {
            candidates: vec![candidate(1, 9), candidate(2, 9)],
        },
        &ledger,
        &MockRenderer::failing_for(1),
        &MockPublisher::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.selected, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(ledger.status_of(1, 9).as_deref(), Some("error"));
    assert_eq!(ledger.status_of(2, 9).as_deref(), Some("completed"));

    let errors = ledger.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].2.contains("template raster failed"));
}

#[tokio::test]
async fn publish_failure_records_error_state() {
    let ledger = MemoryLedger::default();
    let report = run_batch(
        &test_config(),
        &StaticSource {
            candidates: vec![candidate(3, 9)],
        },
        &ledger,
        &MockRenderer::default(),
        &MockPublisher { fail: true },
    )
    .await
    .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(ledger.status_of(3, 9).as_deref(), Some("error"));
    let errors = ledger.errors.lock().unwrap();
    assert!(errors[0].2.contains("quota exceeded"));
}

#[tokio::test]
async fn conflict_skips_candidate_before_rendering() {
    let ledger = MemoryLedger::with_conflict(4, 9);
    let renderer = MockRenderer::default();
    let report = run_batch(
        &test_config(),
        &StaticSource {
            candidates: vec![candidate(4, 9)],
        },
        &ledger,
        &renderer,
        &MockPublisher::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completion_records_the_render_code_and_link() {
    let ledger = MemoryLedger::default();
    run_batch(
        &test_config(),
        &StaticSource {
            candidates: vec![candidate(5, 9)],
        },
        &ledger,
        &MockRenderer::default(),
        &MockPublisher::default(),
    )
    .await
    .unwrap();

    assert!(ledger.record_exists(5, 9).await.unwrap());
    let completed = ledger.completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].2, "code-5");
    assert_eq!(
        completed[0].3,
        "https://drive.google.com/uc?export=download&id=file-5"
    );
}

#[tokio::test]
async fn rerun_over_an_empty_selection_changes_nothing() {
    let ledger = MemoryLedger::default();
    run_batch(
        &test_config(),
        &StaticSource {
            candidates: vec![candidate(6, 9)],
        },
        &ledger,
        &MockRenderer::default(),
        &MockPublisher::default(),
    )
    .await
    .unwrap();
    let after_first = ledger.write_count();

    // A selector that excludes completed pairs yields an empty second batch.
    let report = run_batch(
        &test_config(),
        &StaticSource { candidates: vec![] },
        &ledger,
        &MockRenderer::default(),
        &MockPublisher::default(),
    )
    .await
    .unwrap();

    assert_eq!(report, BatchReport::default());
    assert_eq!(ledger.write_count(), after_first);
}

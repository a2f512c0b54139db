mod auth;

pub use auth::ServiceAccountKey;

use crate::config::Config;
use crate::db::Candidate;
use crate::error::PublishError;
use crate::render::RenderedCertificate;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(
        &self,
        rendered: &RenderedCertificate,
        candidate: &Candidate,
    ) -> Result<String, PublishError>;
}

#[derive(Deserialize)]
struct FileRef {
    id: String,
}

#[derive(Deserialize)]
struct FileList {
    files: Vec<FileRef>,
}

pub struct DriveClient {
    http: Client,
    tokens: auth::TokenProvider,
    root_folder_id: String,
}

impl DriveClient {
    pub fn new(config: &Config) -> Result<Self, PublishError> {
        let key = ServiceAccountKey::from_file(&config.credentials_path)?;
        let tokens = auth::TokenProvider::new(key)?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            tokens,
            root_folder_id: config.root_folder_id.clone(),
        })
    }

    /// Issue a request with a fresh bearer token, retrying rate limits and
    /// server errors with exponential backoff.
    async fn request_with_retry<F>(&self, build: F) -> Result<reqwest::Response, PublishError>
    where
        F: Fn() -> Result<reqwest::RequestBuilder, PublishError>,
    {
        let mut backoff = 2u64;
        let mut attempt = 0u32;
        loop {
            let token = self.tokens.access_token(&self.http).await?;
            let response = build()?.bearer_auth(&token).send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if !retryable || attempt >= MAX_RETRIES {
                let body = response.text().await.unwrap_or_default();
                return Err(PublishError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            warn!(%status, attempt, "drive request failed, retrying");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
            attempt += 1;
        }
    }

    async fn find_folder(
        &self,
        name: &str,
        parent_id: &str,
    ) -> Result<Option<String>, PublishError> {
        let query = format!(
            "name='{}' and mimeType='{FOLDER_MIME}' and '{}' in parents and trashed=false",
            escape_query(name),
            escape_query(parent_id),
        );
        let response = self
            .request_with_retry(|| {
                Ok(self.http.get(DRIVE_FILES_URL).query(&[
                    ("q", query.as_str()),
                    ("spaces", "drive"),
                    ("fields", "files(id, name)"),
                ]))
            })
            .await?;
        let list: FileList = response.json().await?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, PublishError> {
        let metadata = json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent_id],
        });
        let response = self
            .request_with_retry(|| {
                Ok(self
                    .http
                    .post(DRIVE_FILES_URL)
                    .query(&[("fields", "id")])
                    .json(&metadata))
            })
            .await?;
        Ok(response.json::<FileRef>().await?.id)
    }

    /// Walk the path segment by segment under the configured root, creating
    /// missing folders as they are encountered.
    async fn ensure_folder_chain(&self, path: &str) -> Result<String, PublishError> {
        let mut parent = self.root_folder_id.clone();
        for segment in path.split('/') {
            parent = match self.find_folder(segment, &parent).await? {
                Some(id) => id,
                None => self.create_folder(segment, &parent).await?,
            };
        }
        Ok(parent)
    }

    async fn upload_file(
        &self,
        name: &str,
        folder_id: &str,
        content: &[u8],
    ) -> Result<String, PublishError> {
        let metadata = json!({ "name": name, "parents": [folder_id] }).to_string();
        // The upload endpoint takes multipart/related, not form-data.
        let boundary = format!("certifica-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related_body(&metadata, content, &boundary);
        let response = self
            .request_with_retry(|| {
                Ok(self
                    .http
                    .post(DRIVE_UPLOAD_URL)
                    .query(&[("uploadType", "multipart"), ("fields", "id")])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={boundary}"),
                    )
                    .body(body.clone()))
            })
            .await?;
        Ok(response.json::<FileRef>().await?.id)
    }

    async fn share_public(&self, file_id: &str) -> Result<(), PublishError> {
        let permission = json!({ "type": "anyone", "role": "reader" });
        let url = format!("{DRIVE_FILES_URL}/{file_id}/permissions");
        self.request_with_retry(|| {
            Ok(self
                .http
                .post(&url)
                .query(&[("fields", "id")])
                .json(&permission))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Publish for DriveClient {
    async fn publish(
        &self,
        rendered: &RenderedCertificate,
        candidate: &Candidate,
    ) -> Result<String, PublishError> {
        let today = Utc::now().date_naive();
        let path = folder_path(candidate, today.year());
        let folder_id = self.ensure_folder_chain(&path).await?;

        let filename = certificate_filename(&candidate.full_name, today);
        let file_id = self.upload_file(&filename, &folder_id, &rendered.pdf).await?;
        self.share_public(&file_id).await?;

        let url = download_url(&file_id);
        info!(student_id = candidate.student_id, path, filename, "certificate uploaded");
        Ok(url)
    }
}

/// Deterministic path-safe slug: lowercase, latin accents folded, runs of
/// anything else collapsed to a single dash.
pub fn slug(input: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static pattern"));
    let folded: String = input.to_lowercase().chars().map(fold_accent).collect();
    re.replace_all(&folded, "-").trim_matches('-').to_string()
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        other => other,
    }
}

pub fn folder_path(candidate: &Candidate, year: i32) -> String {
    format!(
        "{year}/{}/{}",
        slug(&candidate.course_name),
        slug(&candidate.full_name)
    )
}

pub fn certificate_filename(full_name: &str, date: NaiveDate) -> String {
    format!("certificado_{}_{}.pdf", slug(full_name), date.format("%Y-%m-%d"))
}

fn multipart_related_body(metadata: &str, content: &[u8], boundary: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n--{boundary}\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--").as_bytes());
    body
}

fn download_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&id={file_id}")
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(full_name: &str, course_name: &str) -> Candidate {
        Candidate {
            student_id: 1,
            full_name: full_name.to_string(),
            dni: Some("12345678".to_string()),
            course_id: 9,
            course_name: course_name.to_string(),
            grade: 18.0,
            attempt_date: None,
        }
    }

    #[test]
    fn slug_folds_accents_and_collapses_separators() {
        assert_eq!(slug("María Pérez"), "maria-perez");
        assert_eq!(slug("Seguridad   Industrial"), "seguridad-industrial");
        assert_eq!(slug("  ¡Año: Diseño! "), "ano-diseno");
    }

    #[test]
    fn slug_is_stable_across_calls() {
        let first = slug("María Pérez");
        assert_eq!(first, slug("María Pérez"));
    }

    #[test]
    fn folder_path_is_deterministic() {
        let c = candidate("María Pérez", "Seguridad Industrial");
        assert_eq!(folder_path(&c, 2024), "2024/seguridad-industrial/maria-perez");
        assert_eq!(folder_path(&c, 2024), folder_path(&c, 2024));
    }

    #[test]
    fn filename_embeds_slug_and_date() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(
            certificate_filename("María Pérez", date),
            "certificado_maria-perez_2024-06-01.pdf"
        );
    }

    #[test]
    fn multipart_body_frames_metadata_and_media() {
        let body = multipart_related_body(r#"{"name":"x.pdf"}"#, b"%PDF", "b0undary");
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("--b0undary\r\nContent-Type: application/json"));
        assert!(text.contains(r#"{"name":"x.pdf"}"#));
        assert!(text.contains("Content-Type: application/pdf\r\n\r\n%PDF"));
        assert!(text.ends_with("\r\n--b0undary--"));
    }

    #[test]
    fn download_url_matches_drive_template() {
        assert_eq!(
            download_url("abc123"),
            "https://drive.google.com/uc?export=download&id=abc123"
        );
    }

    #[test]
    fn query_values_are_escaped() {
        assert_eq!(escape_query("O'Brien"), "O\\'Brien");
    }
}

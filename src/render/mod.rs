mod layout;
mod pdf;
mod signer;

pub use signer::PdfSigner;

use crate::config::Config;
use crate::db::Candidate;
use crate::error::RenderError;
use async_trait::async_trait;
use genpdf::fonts::{FontData, FontFamily};
use uuid::Uuid;

/// A signed certificate ready for publishing. Intermediate artifacts are gone
/// by the time this exists; only the document bytes leave the renderer.
pub struct RenderedCertificate {
    pub certificate_id: String,
    pub pdf: Vec<u8>,
}

#[async_trait]
pub trait Render: Send + Sync {
    async fn render(&self, candidate: &Candidate) -> Result<RenderedCertificate, RenderError>;
}

pub struct CertificateRenderer {
    assets: layout::PageAssets,
    document_font: FontFamily<FontData>,
    page_size_mm: (f64, f64),
    signer: PdfSigner,
}

impl CertificateRenderer {
    /// Loads and validates every asset up front so a missing template, font,
    /// or signing key fails before any candidate is touched.
    pub fn new(config: &Config) -> Result<Self, RenderError> {
        let assets = layout::PageAssets::load(&config.templates_path, &config.fonts_path)?;
        let document_font = pdf::load_document_font(&config.fonts_path)?;
        let page_size_mm = config
            .pdf
            .page_size_mm()
            .map_err(RenderError::Pdf)?;
        let signer = PdfSigner::from_config(&config.signature)?;
        Ok(Self {
            assets,
            document_font,
            page_size_mm,
            signer,
        })
    }
}

#[async_trait]
impl Render for CertificateRenderer {
    async fn render(&self, candidate: &Candidate) -> Result<RenderedCertificate, RenderError> {
        let certificate_id = Uuid::new_v4().to_string();

        // Scratch directory scopes every intermediate page file; dropped on
        // success and on failure alike.
        let scratch = tempfile::tempdir()?;
        let first = self.assets.compose_first_page(candidate, &certificate_id)?;
        let second = self.assets.compose_second_page();

        let first_path = scratch.path().join(format!("cert1_{certificate_id}.png"));
        let second_path = scratch.path().join(format!("cert2_{certificate_id}.png"));
        first.save(&first_path)?;
        second.save(&second_path)?;

        let unsigned = pdf::assemble(
            &[first_path, second_path],
            self.document_font.clone(),
            self.page_size_mm,
            &format!("Certificado - {}", candidate.course_name),
        )?;
        let pdf = self.signer.sign(&unsigned)?;

        Ok(RenderedCertificate {
            certificate_id,
            pdf,
        })
    }
}

use crate::db::Candidate;
use crate::error::RenderError;
use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};
use qrcode::QrCode;
use std::path::Path;
use tracing::debug;

const PAGE_ONE_TEMPLATE: &str = "page1.png";
const PAGE_TWO_TEMPLATE: &str = "page2.png";

const NAME_FONT: &str = "Nunito-Italic-VariableFont_wght.ttf";
const DNI_FONT: &str = "Arimo-Italic-VariableFont_wght.ttf";
const COURSE_FONT: &str = "DMSerifText-Regular.ttf";

const NAME_COLOR: Rgba<u8> = Rgba([0, 32, 96, 255]);
const DNI_COLOR: Rgba<u8> = Rgba([53, 55, 68, 255]);
const COURSE_COLOR: Rgba<u8> = Rgba([7, 55, 99, 255]);

// Field anchors and point sizes tuned to the fixed background templates.
const NAME_POS: (i32, i32) = (300, 300);
const NAME_SIZE_PT: f32 = 30.0;
const DNI_POS: (i32, i32) = (250, 400);
const DNI_SIZE_PT: f32 = 14.0;
const COURSE_POS: (i32, i32) = (250, 500);
const COURSE_SIZE_PT: f32 = 25.0;

const QR_POS: (i64, i64) = (90, 540);
const QR_SIZE: u32 = 160;

/// Shrink an overflowing field down to this fraction of its base size before
/// giving up; silent truncation is never an option.
const MIN_FIT_RATIO: f32 = 0.6;

fn px(points: f32) -> PxScale {
    PxScale::from(points * 96.0 / 72.0)
}

/// Background templates and fonts, loaded and validated once at startup.
pub struct PageAssets {
    page1: RgbaImage,
    page2: RgbaImage,
    name_font: FontVec,
    dni_font: FontVec,
    course_font: FontVec,
}

impl PageAssets {
    pub fn load(templates_path: &Path, fonts_path: &Path) -> Result<Self, RenderError> {
        let page1 = image::open(templates_path.join(PAGE_ONE_TEMPLATE))?.to_rgba8();
        let page2 = image::open(templates_path.join(PAGE_TWO_TEMPLATE))?.to_rgba8();
        Ok(Self {
            page1,
            page2,
            name_font: load_font(fonts_path, NAME_FONT)?,
            dni_font: load_font(fonts_path, DNI_FONT)?,
            course_font: load_font(fonts_path, COURSE_FONT)?,
        })
    }

    /// Template plus the three student fields and the scannable verification
    /// code.
    pub fn compose_first_page(
        &self,
        candidate: &Candidate,
        certificate_id: &str,
    ) -> Result<RgbaImage, RenderError> {
        let mut page = self.page1.clone();
        draw_field(
            &mut page,
            "full_name",
            &candidate.full_name,
            NAME_POS,
            NAME_SIZE_PT,
            NAME_COLOR,
            &self.name_font,
        )?;
        if let Some(dni) = candidate.dni.as_deref() {
            draw_field(&mut page, "dni", dni, DNI_POS, DNI_SIZE_PT, DNI_COLOR, &self.dni_font)?;
        }
        draw_field(
            &mut page,
            "course_name",
            &candidate.course_name,
            COURSE_POS,
            COURSE_SIZE_PT,
            COURSE_COLOR,
            &self.course_font,
        )?;
        overlay_verification_code(&mut page, certificate_id)?;
        Ok(page)
    }

    /// Static content only; extension point for future dynamic fields.
    pub fn compose_second_page(&self) -> RgbaImage {
        self.page2.clone()
    }
}

fn load_font(dir: &Path, name: &str) -> Result<FontVec, RenderError> {
    let bytes = std::fs::read(dir.join(name))?;
    FontVec::try_from_vec(bytes).map_err(|e| RenderError::Font {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn draw_field(
    page: &mut RgbaImage,
    field: &'static str,
    text: &str,
    (x, y): (i32, i32),
    size_pt: f32,
    color: Rgba<u8>,
    font: &FontVec,
) -> Result<(), RenderError> {
    let scale = fit_scale(page.width(), x, size_pt, font, text)
        .ok_or(RenderError::Overflow { field })?;
    draw_text_mut(page, color, x, y, scale, font, text);
    Ok(())
}

/// Largest scale at or below the base size at which the text fits the page
/// width, or None once shrinking would distort the layout too far.
fn fit_scale(
    page_width: u32,
    x: i32,
    base_pt: f32,
    font: &FontVec,
    text: &str,
) -> Option<PxScale> {
    let available = page_width.saturating_sub(x.max(0) as u32);
    let floor = base_pt * MIN_FIT_RATIO;
    let mut size = base_pt;
    loop {
        let scale = px(size);
        let (width, _) = text_size(scale, font, text);
        if width <= available {
            if size < base_pt {
                debug!(text, from = base_pt, to = size, "shrunk field to fit page");
            }
            return Some(scale);
        }
        size -= 1.0;
        if size < floor {
            return None;
        }
    }
}

fn overlay_verification_code(page: &mut RgbaImage, certificate_id: &str) -> Result<(), RenderError> {
    let code = QrCode::new(certificate_id.as_bytes()).map_err(|e| RenderError::Code(e.to_string()))?;
    let rendered = code
        .render::<image::Luma<u8>>()
        .max_dimensions(QR_SIZE, QR_SIZE)
        .build();
    let rendered = image::DynamicImage::ImageLuma8(rendered).to_rgba8();
    image::imageops::overlay(page, &rendered, QR_POS.0, QR_POS.1);
    Ok(())
}

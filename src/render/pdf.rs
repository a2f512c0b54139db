use crate::error::RenderError;
use genpdf::{elements, fonts};
use std::path::{Path, PathBuf};

/// Candidate families for the document's base font. The pages are full-bleed
/// images, so any resolvable family works; genpdf still needs one for metrics.
const FONT_DIRS: &[&str] = &[
    "/usr/share/fonts/truetype/liberation",
    "/usr/share/fonts/TTF",
    "/System/Library/Fonts/Supplemental",
    "/Library/Fonts",
];
const FONT_NAMES: &[&str] = &["LiberationSans", "DejaVuSans", "Arial"];

pub fn load_document_font(
    fonts_path: &Path,
) -> Result<fonts::FontFamily<fonts::FontData>, RenderError> {
    let mut dirs = vec![fonts_path.to_path_buf()];
    dirs.extend(FONT_DIRS.iter().map(PathBuf::from));

    dirs.iter()
        .filter(|dir| dir.exists())
        .find_map(|dir| {
            FONT_NAMES
                .iter()
                .find_map(|name| fonts::from_files(dir, name, None).ok())
        })
        .ok_or_else(|| {
            RenderError::Pdf(
                "no base font family found; install fonts-liberation or add one to FONTS_PATH"
                    .to_string(),
            )
        })
}

/// Assemble one full-bleed image per page at the given page size.
pub fn assemble(
    pages: &[PathBuf],
    font: fonts::FontFamily<fonts::FontData>,
    (width_mm, height_mm): (f64, f64),
    title: &str,
) -> Result<Vec<u8>, RenderError> {
    let mut doc = genpdf::Document::new(font);
    doc.set_title(title);
    doc.set_paper_size(genpdf::Size::new(width_mm, height_mm));

    let mut decorator = genpdf::SimplePageDecorator::new();
    decorator.set_margins(0);
    doc.set_page_decorator(decorator);

    for (index, page) in pages.iter().enumerate() {
        if index > 0 {
            doc.push(elements::PageBreak::new());
        }
        let (pixel_width, _) = image::image_dimensions(page)?;
        // DPI at which this bitmap exactly covers the page width.
        let dpi = f64::from(pixel_width) * 25.4 / width_mm;
        let element = elements::Image::from_path(page)
            .map_err(|e| RenderError::Pdf(e.to_string()))?
            .with_dpi(dpi);
        doc.push(element);
    }

    let mut out = Vec::new();
    doc.render(&mut out)
        .map_err(|e| RenderError::Pdf(e.to_string()))?;
    Ok(out)
}

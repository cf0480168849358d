//! PDF page rasterization on top of pdfium.
//!
//! Pages are rendered strictly one at a time: each iteration renders,
//! converts, encodes, and releases a single page, so peak memory stays at
//! one decoded plus one encoded page no matter how large the document is.

use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat};
use pdfium_render::prelude::*;
use thiserror::Error;

pub(crate) const DEFAULT_DPI: f32 = 300.0;
pub(crate) const DEFAULT_PAGE_LIMIT: usize = 100;

const POINTS_PER_INCH: f32 = 72.0;
// Used when a caller passes a non-positive dpi; equals 300 dpi.
const FALLBACK_SCALE: f32 = 4.1667;

/// Per-page transform applied after the optional grayscale conversion and
/// before PNG encoding.
pub(crate) type PageHook = dyn Fn(DynamicImage) -> DynamicImage + Send + Sync;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderOptions {
    pub(crate) dpi: f32,
    pub(crate) page_limit: usize,
    pub(crate) annotations: bool,
    pub(crate) grayscale: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            page_limit: DEFAULT_PAGE_LIMIT,
            annotations: true,
            grayscale: true,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RenderedPage {
    pub(crate) index: usize,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) grayscale: bool,
    pub(crate) png: Vec<u8>,
}

/// Document-level facts. `page_count` is the true total even when the page
/// limit truncated the output.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenderMeta {
    pub(crate) page_count: usize,
    pub(crate) dpi: f32,
    pub(crate) grayscale: bool,
    pub(crate) annotations: bool,
}

#[derive(Debug, Error)]
pub(crate) enum RenderError {
    #[error("failed_to_open_pdf")]
    FailedToOpen,
    #[error("render_failed_on_page_{index}")]
    PageFailed { index: usize },
    #[error("pdf renderer unavailable: {0}")]
    Unavailable(String),
    #[error("render task failed: {0}")]
    Task(String),
}

/// Renders up to `options.page_limit` pages off the async runtime.
pub(crate) async fn render_async(
    pdf_bytes: Vec<u8>,
    options: RenderOptions,
    hook: Option<Arc<PageHook>>,
) -> Result<(Vec<RenderedPage>, RenderMeta), RenderError> {
    tokio::task::spawn_blocking(move || render(pdf_bytes, options, hook.as_deref()))
        .await
        .map_err(|err| RenderError::Task(err.to_string()))?
}

pub(crate) fn render(
    pdf_bytes: Vec<u8>,
    options: RenderOptions,
    hook: Option<&PageHook>,
) -> Result<(Vec<RenderedPage>, RenderMeta), RenderError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_vec(pdf_bytes, None)
        .map_err(|_| RenderError::FailedToOpen)?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let scale = render_scale(options.dpi);
    let limit = page_count.min(options.page_limit);

    let mut rendered = Vec::with_capacity(limit);
    for index in 0..limit {
        let mut image = {
            let page = pages
                .get(index as u16)
                .map_err(|_| RenderError::PageFailed { index })?;

            let target_width = (page.width().value * scale).round().max(1.0) as i32;
            let config = PdfRenderConfig::new()
                .set_target_width(target_width)
                .render_annotations(options.annotations)
                .render_form_data(options.annotations);

            let bitmap = page
                .render_with_config(&config)
                .map_err(|_| RenderError::PageFailed { index })?;
            bitmap.as_image()
        };

        if options.grayscale {
            image = DynamicImage::ImageLuma8(image.to_luma8());
        }
        if let Some(hook) = hook {
            image = hook(image);
        }

        let (width, height) = (image.width(), image.height());
        let png = encode_png(&image).map_err(|_| RenderError::PageFailed { index })?;
        rendered.push(RenderedPage {
            index,
            width,
            height,
            grayscale: options.grayscale,
            png,
        });
    }

    let meta = RenderMeta {
        page_count,
        dpi: options.dpi,
        grayscale: options.grayscale,
        annotations: options.annotations,
    };
    Ok((rendered, meta))
}

fn bind_pdfium() -> Result<Pdfium, RenderError> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|err| RenderError::Unavailable(format!("{err:?}")))?;
    Ok(Pdfium::new(bindings))
}

pub(crate) fn render_scale(dpi: f32) -> f32 {
    if dpi > 0.0 {
        dpi / POINTS_PER_INCH
    } else {
        FALLBACK_SCALE
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn scale_follows_dpi_over_points_per_inch() {
        assert!((render_scale(300.0) - 300.0 / 72.0).abs() < 1e-5);
        assert!((render_scale(72.0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn non_positive_dpi_uses_fallback_scale() {
        assert!((render_scale(0.0) - FALLBACK_SCALE).abs() < 1e-5);
        assert!((render_scale(-120.0) - FALLBACK_SCALE).abs() < 1e-5);
    }

    #[test]
    fn default_options_match_pipeline_contract() {
        let options = RenderOptions::default();
        assert_eq!(options.dpi, 300.0);
        assert_eq!(options.page_limit, 100);
        assert!(options.annotations);
        assert!(options.grayscale);
    }

    #[test]
    fn error_codes_render_as_stable_strings() {
        assert_eq!(RenderError::FailedToOpen.to_string(), "failed_to_open_pdf");
        assert_eq!(
            RenderError::PageFailed { index: 3 }.to_string(),
            "render_failed_on_page_3"
        );
    }

    #[test]
    fn encoded_pages_round_trip_to_reported_dimensions() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(7, 5, image::Luma([128])));
        let png = encode_png(&image).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 7);
        assert_eq!(decoded.height(), 5);
    }
}

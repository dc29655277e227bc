// agent-chat/crates/agent-chat/src/conversion/mod.rs
//! Turning uploads into page images the model can look at.
//!
//! Office documents go through LibreOffice to PDF, PDFs are rasterized with
//! `pdftoppm`, and every page ends up as a bounded-size JPEG.

pub mod renderer;

pub use renderer::CliRenderer;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::chat_db::NewFileImage;

/// Upload categories the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Image,
    Pdf,
    Docx,
    Ppt,
}

impl DocumentKind {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match mime.as_str() {
            "image/png" | "image/jpeg" | "image/jpg" | "image/webp" | "image/gif" => Some(DocumentKind::Image),
            "application/pdf" => Some(DocumentKind::Pdf),
            "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(DocumentKind::Docx),
            "application/vnd.ms-powerpoint"
            | "application/vnd.openxmlformats-officedocument.presentationml.presentation" => Some(DocumentKind::Ppt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Image => "image",
            DocumentKind::Pdf => "pdf",
            DocumentKind::Docx => "docx",
            DocumentKind::Ppt => "ppt",
        }
    }

    /// Extension LibreOffice needs to pick the right import filter.
    pub(crate) fn office_extension(&self) -> Option<&'static str> {
        match self {
            DocumentKind::Docx => Some("docx"),
            DocumentKind::Ppt => Some("pptx"),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(DocumentKind::Image),
            "pdf" => Ok(DocumentKind::Pdf),
            "docx" => Ok(DocumentKind::Docx),
            "ppt" => Ok(DocumentKind::Ppt),
            other => Err(ConversionError::UnsupportedType(other.to_string())),
        }
    }
}

/// One rendered page, ready to store.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page_number: i64,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

impl From<PageImage> for NewFileImage {
    fn from(page: PageImage) -> Self {
        NewFileImage {
            page_number: page.page_number,
            image_data: page.data,
            width: page.width,
            height: page.height,
            mime_type: page.mime_type,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("{0} is not installed or not on PATH")]
    ToolMissing(String),
    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },
    #[error("Document produced no pages")]
    NoPages,
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders an upload into pages. `client_pages` are images the browser
/// already rendered (PDF only) and are preferred when present.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        kind: DocumentKind,
        data: &[u8],
        client_pages: &[Vec<u8>],
    ) -> Result<Vec<PageImage>, ConversionError>;
}

/// JPEG re-encoding with a cap on the longest side.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompressor {
    pub quality: u8,
    pub max_dimension: u32,
}

impl ImageCompressor {
    pub fn new(quality: u8, max_dimension: u32) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_dimension: max_dimension.max(1),
        }
    }

    pub fn compress(&self, bytes: &[u8], page_number: i64) -> Result<PageImage, ConversionError> {
        let decoded = image::load_from_memory(bytes)?;
        let (width, height) = decoded.dimensions();

        let resized = if width.max(height) > self.max_dimension {
            decoded.resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3)
        } else {
            decoded
        };
        let rgb = flatten_onto_white(&resized);

        let mut data = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut data, self.quality))?;
        Ok(PageImage {
            page_number,
            data,
            width: rgb.width(),
            height: rgb.height(),
            mime_type: "image/jpeg".to_string(),
        })
    }
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

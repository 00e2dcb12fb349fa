use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageResult};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::asset::Asset;
use crate::transform::{Context, Transform, TransformError};

fn raster_format(asset: &Asset) -> Option<ImageFormat> {
    let format = match asset.extension() {
        Some(ext) => ImageFormat::from_extension(ext),
        None => image::guess_format(asset.content().as_bytes()).ok(),
    };

    format.filter(|f| matches!(f, ImageFormat::Png | ImageFormat::Jpeg))
}

fn decode(asset: &Asset, format: ImageFormat) -> ImageResult<DynamicImage> {
    image::load_from_memory_with_format(asset.content().as_bytes(), format)
}

/// Re-encodes PNG and JPEG images, keeping whichever of the original and
/// the re-encoding is smaller. Other assets pass through.
#[derive(Debug, Clone, Copy)]
pub struct Optimize {
    jpeg_quality: u8,
    max_bytes: Option<u64>,
}

impl Optimize {
    pub const DEFAULT_JPEG_QUALITY: u8 = 90;

    pub fn new() -> Self {
        Optimize { jpeg_quality: Self::DEFAULT_JPEG_QUALITY, max_bytes: None }
    }

    /// JPEG quality, clamped to `1..=100`.
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Fails any image still larger than `bytes` after optimization.
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = Some(bytes);
        self
    }

    fn encode(&self, image: &DynamicImage, format: ImageFormat) -> ImageResult<Vec<u8>> {
        let mut out = vec![];
        match format {
            ImageFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, self.jpeg_quality))?;
            }
            _ => {
                let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive);
                image.write_with_encoder(encoder)?;
            }
        }

        Ok(out)
    }
}

impl Default for Optimize {
    fn default() -> Self {
        Optimize::new()
    }
}

impl Transform for Optimize {
    fn name(&self) -> &'static str {
        "optimize"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let Some(format) = raster_format(asset) else {
            return Ok(vec![asset.clone()]);
        };

        let error = |e| TransformError::new(self.name(), asset.path(), e);
        let image = decode(asset, format).map_err(error)?;
        let encoded = self.encode(&image, format).map_err(error)?;

        let original = asset.content().as_bytes();
        let optimized = match encoded.len() < original.len() {
            true => asset.with_content(encoded),
            false => asset.clone(),
        };

        let size = optimized.content().len() as u64;
        if let Some(max) = self.max_bytes.filter(|&max| size > max) {
            let cause = format!("optimized size of {size} bytes exceeds the {max} byte budget");
            return Err(TransformError::new(self.name(), asset.path(), cause));
        }

        tracing::trace!(path = %asset.path().display(), before = original.len(), after = size, "optimized image");
        Ok(vec![optimized])
    }
}

/// Converts PNG and JPEG images to lossless WebP with a `.webp` extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct Webp;

impl Transform for Webp {
    fn name(&self) -> &'static str {
        "webp"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        let format = raster_format(asset).ok_or_else(|| {
            TransformError::new(self.name(), asset.path(), "only PNG and JPEG images convert to WebP")
        })?;

        let error = |e| TransformError::new(self.name(), asset.path(), e);
        let image = decode(asset, format).map_err(error)?;
        let rgba = DynamicImage::ImageRgba8(image.to_rgba8());

        let mut out = Cursor::new(vec![]);
        rgba.write_with_encoder(WebPEncoder::new_lossless(&mut out)).map_err(error)?;

        let path = asset.path().with_extension("webp");
        Ok(vec![asset.with_path(path).with_content(out.into_inner())])
    }
}

static XML_PROLOG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\?xml[^>]*\?>").expect("valid regex"));
static DOCTYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<!DOCTYPE[^>]*>").expect("valid regex"));
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static BETWEEN_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r">\s+<").expect("valid regex"));

/// Minifies SVG markup. Non-SVG assets pass through.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvgMin;

impl SvgMin {
    pub fn minify(svg: &str) -> String {
        let svg = XML_PROLOG.replace_all(svg, "");
        let svg = DOCTYPE.replace_all(&svg, "");
        let svg = COMMENT.replace_all(&svg, "");
        BETWEEN_TAGS.replace_all(svg.trim(), "><").into_owned()
    }
}

impl Transform for SvgMin {
    fn name(&self) -> &'static str {
        "svgmin"
    }

    fn apply(&self, asset: &Asset, _: &Context) -> Result<Vec<Asset>, TransformError> {
        if asset.extension() != Some("svg") {
            return Ok(vec![asset.clone()]);
        }

        let svg = asset.text(self.name())?;
        Ok(vec![asset.with_content(SvgMin::minify(svg))])
    }
}

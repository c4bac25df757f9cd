//! Image validation: confirm format and size bounds before any expensive work.
//!
//! ## Why read the header before decoding?
//!
//! The hard ceiling exists to bound decode cost. A 20 000 × 20 000 PNG
//! decodes to 1.2 GB of RGB pixels; checking its IHDR first lets us reject it
//! after reading a few dozen bytes. The sequence is:
//!
//! 1. sniff the format from magic bytes (unknown → `InvalidImage`)
//! 2. check the allow-list (→ `UnsupportedFormat`)
//! 3. read dimensions from the header (unreadable → `InvalidImage`)
//! 4. apply the hard ceiling (→ `ImageTooLarge`)
//! 5. full decode (corrupt/truncated → `InvalidImage`)

use crate::config::{CaptionConfig, ImageFormatTag};
use crate::error::{Failure, FailureKind};
use crate::pipeline::resolve::RawImageBytes;
use image::{ColorType, DynamicImage, ImageReader, Limits};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// Color representation of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    Rgba,
    Grayscale,
    GrayscaleAlpha,
    /// Anything else. Palette images never land here: the decoders expand
    /// palettes to RGB or RGBA.
    Other,
}

impl ColorMode {
    fn from_color_type(color: ColorType) -> Self {
        match color {
            ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => ColorMode::Rgb,
            ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => ColorMode::Rgba,
            ColorType::L8 | ColorType::L16 => ColorMode::Grayscale,
            ColorType::La8 | ColorType::La16 => ColorMode::GrayscaleAlpha,
            _ => ColorMode::Other,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColorMode::Rgb => "RGB",
            ColorMode::Rgba => "RGBA",
            ColorMode::Grayscale => "L",
            ColorMode::GrayscaleAlpha => "LA",
            ColorMode::Other => "other",
        };
        f.write_str(s)
    }
}

/// A decoded image owned by one pipeline invocation. Dimensions are > 0.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    format: ImageFormatTag,
    image: DynamicImage,
}

impl DecodedImage {
    /// Wrap an already-decoded image. Returns `None` for zero-sized images.
    pub fn new(format: ImageFormatTag, image: DynamicImage) -> Option<Self> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        Some(Self { format, image })
    }

    pub fn format(&self) -> ImageFormatTag {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn color_mode(&self) -> ColorMode {
        ColorMode::from_color_type(self.image.color())
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

/// The bounds the validator enforces.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Longest edge accepted, inclusive.
    pub hard_edge: u32,
    pub supported_formats: Vec<ImageFormatTag>,
}

impl ValidationLimits {
    pub fn from_config(config: &CaptionConfig) -> Self {
        Self {
            hard_edge: config.hard_edge(),
            supported_formats: config.supported_formats.clone(),
        }
    }
}

/// Validate and decode raw bytes.
pub fn validate(raw: &RawImageBytes, limits: &ValidationLimits) -> Result<DecodedImage, Failure> {
    if raw.is_empty() {
        return Err(Failure::invalid_image("corrupt or unreadable: empty file"));
    }

    // ── Step 1: Sniff the format ─────────────────────────────────────────
    let sniffed = image::guess_format(&raw.bytes)
        .map_err(|_| Failure::invalid_image("corrupt or unreadable"))?;

    // ── Step 2: Allow-list ───────────────────────────────────────────────
    let format = ImageFormatTag::from_image_format(sniffed)
        .filter(|f| limits.supported_formats.contains(f))
        .ok_or_else(|| {
            let allowed: Vec<String> = limits
                .supported_formats
                .iter()
                .map(|f| f.to_string())
                .collect();
            Failure::new(
                FailureKind::UnsupportedFormat,
                format!(
                    "{:?} is not supported. Supported formats: {}",
                    sniffed,
                    allowed.join(", ")
                ),
            )
        })?;

    if let Some(declared) = raw.declared_format {
        if declared != format {
            debug!("Declared format {} differs from sniffed {}", declared, format);
        }
    }

    // ── Step 3: Header dimensions ────────────────────────────────────────
    let (width, height) = reader(raw, sniffed, Limits::no_limits())
        .into_dimensions()
        .map_err(|e| Failure::invalid_image(format!("corrupt or unreadable: {e}")))?;

    // ── Step 4: Hard ceiling ─────────────────────────────────────────────
    let longest = width.max(height);
    if longest > limits.hard_edge {
        return Err(Failure::new(
            FailureKind::ImageTooLarge,
            format!(
                "{}x{} exceeds the maximum size of {}px",
                width, height, limits.hard_edge
            ),
        ));
    }

    // ── Step 5: Full decode ──────────────────────────────────────────────
    let mut decode_limits = Limits::no_limits();
    decode_limits.max_image_width = Some(limits.hard_edge);
    decode_limits.max_image_height = Some(limits.hard_edge);

    let image = reader(raw, sniffed, decode_limits)
        .decode()
        .map_err(|e| Failure::invalid_image(format!("corrupt or unreadable: {e}")))?;

    let decoded = DecodedImage::new(format, image)
        .ok_or_else(|| Failure::invalid_image("corrupt or unreadable: image has no pixels"))?;

    debug!(
        "Validated {} image {}x{} {}",
        decoded.format(),
        decoded.width(),
        decoded.height(),
        decoded.color_mode()
    );
    Ok(decoded)
}

fn reader(raw: &RawImageBytes, format: image::ImageFormat, limits: Limits) -> ImageReader<Cursor<&[u8]>> {
    let mut reader = ImageReader::with_format(Cursor::new(raw.bytes.as_slice()), format);
    reader.limits(limits);
    reader
}

//! Metadata removal by re-encoding.
//!
//! Standard formats are decoded and the pixels copied into a fresh buffer
//! before encoding again, so nothing from the original container (EXIF,
//! IPTC, XMP, ICC, text chunks) reaches the output. The color type is kept
//! unless the target encoder can't write it. Canon RAW files are developed
//! into a JPEG instead ([`raw`]).

pub mod raw;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, Pixel, RgbImage};
use std::borrow::Cow;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::ProcessError;
use crate::pipeline::{ImageKind, UploadedImage};
use crate::session::Session;

/// JPEG quality used when re-encoding a stripped JPEG.
pub const JPEG_QUALITY: u8 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripOptions {
    /// JPEG quality for developed RAW files.
    pub raw_jpeg_quality: u8,
}

impl Default for StripOptions {
    fn default() -> Self {
        Self { raw_jpeg_quality: 95 }
    }
}

/// Write a metadata-free copy of `image` into `output_dir`.
///
/// Standard formats keep their basename and format. A `.cr2` becomes
/// `<stem>.jpg`.
pub fn strip_metadata(
    session: &Session,
    image: &UploadedImage,
    output_dir: &Path,
    options: &StripOptions,
) -> Result<PathBuf, ProcessError> {
    let kind = image.kind.ok_or_else(|| {
        ProcessError::UnsupportedFormat(format!("{}: not a recognised image type", image.name))
    })?;

    let scratch = session.scratch_copy(&image.name, &image.bytes)?;

    if kind == ImageKind::Cr2 {
        let developed = raw::develop_file(scratch.path())?;
        let output_path = output_dir.join(output_name(image));
        write_jpeg(&developed, &output_path, options.raw_jpeg_quality)?;
        log::debug!("Developed RAW to {}", output_path.display());
        return Ok(output_path);
    }

    let format = kind.image_format().ok_or_else(|| {
        ProcessError::UnsupportedFormat(format!("{}: no standard codec", image.name))
    })?;
    let staged = std::fs::read(scratch.path())
        .map_err(|e| ProcessError::io(format!("failed to read {}", scratch.path().display()), e))?;
    let decoded = image::load_from_memory_with_format(&staged, format)?;
    let clean = repaint(&decoded);

    let output_path = output_dir.join(output_name(image));
    encode(&clean, format, &output_path)?;
    log::debug!("Stripped copy written to {}", output_path.display());
    Ok(output_path)
}

/// Basename of the stripped copy: unchanged, except RAW becomes `<stem>.jpg`.
fn output_name(image: &UploadedImage) -> String {
    match image.kind {
        Some(ImageKind::Cr2) => format!("{}.jpg", image.stem()),
        _ => image.name.clone(),
    }
}

/// Copy the decoded pixels into a newly allocated buffer of the same color
/// type and dimensions.
pub fn repaint(img: &DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageLuma8(buf) => DynamicImage::ImageLuma8(fresh(buf)),
        DynamicImage::ImageLumaA8(buf) => DynamicImage::ImageLumaA8(fresh(buf)),
        DynamicImage::ImageRgb8(buf) => DynamicImage::ImageRgb8(fresh(buf)),
        DynamicImage::ImageRgba8(buf) => DynamicImage::ImageRgba8(fresh(buf)),
        DynamicImage::ImageLuma16(buf) => DynamicImage::ImageLuma16(fresh(buf)),
        DynamicImage::ImageLumaA16(buf) => DynamicImage::ImageLumaA16(fresh(buf)),
        DynamicImage::ImageRgb16(buf) => DynamicImage::ImageRgb16(fresh(buf)),
        DynamicImage::ImageRgba16(buf) => DynamicImage::ImageRgba16(fresh(buf)),
        DynamicImage::ImageRgb32F(buf) => DynamicImage::ImageRgb32F(fresh(buf)),
        DynamicImage::ImageRgba32F(buf) => DynamicImage::ImageRgba32F(fresh(buf)),
        other => DynamicImage::ImageRgba8(fresh(&other.to_rgba8())),
    }
}

fn fresh<P: Pixel>(src: &ImageBuffer<P, Vec<P::Subpixel>>) -> ImageBuffer<P, Vec<P::Subpixel>> {
    let mut out = ImageBuffer::new(src.width(), src.height());
    for (dst, px) in out.pixels_mut().zip(src.pixels()) {
        *dst = *px;
    }
    out
}

/// Convert to a color type the target encoder accepts, borrowing when it
/// already does.
fn encodable(img: &DynamicImage, format: ImageFormat) -> Cow<'_, DynamicImage> {
    use image::ColorType as C;

    let color = img.color();
    let converted = match format {
        ImageFormat::Jpeg => match color {
            C::L8 | C::Rgb8 => None,
            C::L16 => Some(DynamicImage::ImageLuma8(img.to_luma8())),
            _ => Some(DynamicImage::ImageRgb8(img.to_rgb8())),
        },
        ImageFormat::Png => match color {
            C::Rgb32F | C::Rgba32F => Some(DynamicImage::ImageRgba16(img.to_rgba16())),
            _ => None,
        },
        ImageFormat::Tiff => match color {
            C::La8 => Some(DynamicImage::ImageRgba8(img.to_rgba8())),
            C::La16 | C::Rgb32F | C::Rgba32F => {
                Some(DynamicImage::ImageRgba16(img.to_rgba16()))
            }
            _ => None,
        },
        ImageFormat::Gif => match color {
            C::Rgb8 | C::Rgba8 => None,
            _ => Some(DynamicImage::ImageRgba8(img.to_rgba8())),
        },
        _ => match color {
            C::L8 | C::La8 | C::Rgb8 | C::Rgba8 => None,
            _ => Some(DynamicImage::ImageRgba8(img.to_rgba8())),
        },
    };

    match converted {
        Some(img) => {
            log::debug!("Converting {color:?} to {:?} for {format:?}", img.color());
            Cow::Owned(img)
        }
        None => Cow::Borrowed(img),
    }
}

/// The output file is only created once encoding has succeeded.
fn write_output(path: &Path, bytes: Vec<u8>) -> Result<(), ProcessError> {
    std::fs::write(path, bytes)
        .map_err(|e| ProcessError::io(format!("failed to write {}", path.display()), e))
}

fn encode(img: &DynamicImage, format: ImageFormat, path: &Path) -> Result<(), ProcessError> {
    let img = encodable(img, format);
    let mut buf = Cursor::new(Vec::new());
    if format == ImageFormat::Jpeg {
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))?;
    } else {
        img.write_to(&mut buf, format)?;
    }
    write_output(path, buf.into_inner())
}

fn write_jpeg(img: &RgbImage, path: &Path, quality: u8) -> Result<(), ProcessError> {
    let mut buf = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
    write_output(path, buf)
}

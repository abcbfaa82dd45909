//! Embedding descriptive metadata into image files.
//!
//! - JPEG: IPTC-IIM in an APP13 segment ([`iptc`])
//! - PNG: `tEXt` / `iTXt` chunks ([`png_text`])
//!
//! Every other format is rejected with [`ProcessError::UnsupportedFormat`].

mod iptc;
mod png_text;

pub use iptc::{read_iptc, write_iptc};
pub use png_text::{read_png_text, write_png_text};

use std::path::{Path, PathBuf};

use crate::ai::MetadataRecord;
use crate::error::ProcessError;
use crate::pipeline::{ImageKind, UploadedImage};
use crate::session::Session;

/// Fail early for anything the writer can't tag.
pub fn ensure_writable(image: &UploadedImage) -> Result<ImageKind, ProcessError> {
    match image.kind {
        Some(kind @ (ImageKind::Jpeg | ImageKind::Png)) => Ok(kind),
        _ => Err(ProcessError::UnsupportedFormat(format!(
            "{}: only JPEG and PNG can be tagged",
            image.name
        ))),
    }
}

/// Write `record` into a copy of `image` at `output_path`.
///
/// The upload is staged as a scratch file in the session workspace for the
/// duration of the call.
pub fn write_metadata(
    session: &Session,
    image: &UploadedImage,
    record: &MetadataRecord,
    output_path: &Path,
) -> Result<PathBuf, ProcessError> {
    let kind = ensure_writable(image)?;

    let scratch = session.scratch_copy(&image.name, &image.bytes)?;
    let staged = std::fs::read(scratch.path())
        .map_err(|e| ProcessError::io(format!("failed to read {}", scratch.path().display()), e))?;

    let tagged = match kind {
        ImageKind::Jpeg => write_iptc(&staged, record)?,
        _ => write_png_text(&staged, record)?,
    };

    std::fs::write(output_path, tagged)
        .map_err(|e| ProcessError::io(format!("failed to write {}", output_path.display()), e))?;
    log::debug!("Metadata written to {}", output_path.display());
    Ok(output_path.to_path_buf())
}

/// Read back whatever [`write_metadata`] would have written.
pub fn read_metadata(kind: ImageKind, bytes: &[u8]) -> Result<MetadataRecord, ProcessError> {
    match kind {
        ImageKind::Jpeg => read_iptc(bytes),
        ImageKind::Png => read_png_text(bytes),
        other => Err(ProcessError::UnsupportedFormat(format!(
            "{other:?} files carry no tags this tool reads"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([10, 200, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn record() -> MetadataRecord {
        MetadataRecord {
            caption: Some("Putting green".into()),
            keywords: Some(vec!["golf".into(), "green".into()]),
            ..Default::default()
        }
    }

    #[test]
    fn jpeg_is_tagged_and_scratch_removed() {
        let session = Session::new().unwrap();
        let image = UploadedImage::new("green.JPG", encoded(ImageFormat::Jpeg));
        let out = session.output_dir(crate::pipeline::Mode::Tagging).unwrap().join("green.JPG");

        let written = write_metadata(&session, &image, &record(), &out).unwrap();
        assert_eq!(written, out);

        let back = read_metadata(ImageKind::Jpeg, &std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(back, record());
        assert!(!session.workspace().join("scratch-green.JPG").exists());
    }

    #[test]
    fn png_is_tagged() {
        let session = Session::new().unwrap();
        let image = UploadedImage::new("green.png", encoded(ImageFormat::Png));
        let out = session.workspace().join("out.png");

        write_metadata(&session, &image, &record(), &out).unwrap();
        let back = read_metadata(ImageKind::Png, &std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn gif_is_unsupported() {
        let session = Session::new().unwrap();
        let image = UploadedImage::new("anim.gif", b"GIF89a\x04\x00\x04\x00".to_vec());
        let out = session.workspace().join("anim.gif");

        let err = write_metadata(&session, &image, &record(), &out).unwrap_err();
        assert!(matches!(err, ProcessError::UnsupportedFormat(_)));
        assert!(!out.exists());
    }

    #[test]
    fn corrupt_jpeg_fails_and_cleans_scratch() {
        let session = Session::new().unwrap();
        let image = UploadedImage::new("broken.jpg", b"definitely not a jpeg".to_vec());
        let out = session.workspace().join("broken.jpg");

        let err = write_metadata(&session, &image, &record(), &out).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Codec);
        assert!(!session.workspace().join("scratch-broken.jpg").exists());
    }
}

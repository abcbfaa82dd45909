use image::ImageFormat;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::ai::{self, Analyzer};
use crate::config::Config;
use crate::error::ProcessError;
use crate::metadata;
use crate::session::Session;
use crate::strip::{self, StripOptions};

/// Image formats the tool accepts, detected from the file extension.
///
/// Only [`ImageKind::Jpeg`] and [`ImageKind::Png`] can be tagged. All of them
/// can be stripped; [`ImageKind::Cr2`] needs the `raw` feature.
///
/// # Example
///
/// ```rust
/// use metatag::pipeline::ImageKind;
/// use std::path::Path;
///
/// assert_eq!(ImageKind::from_path(Path::new("IMG_0042.CR2")), Some(ImageKind::Cr2));
/// assert_eq!(ImageKind::from_path(Path::new("notes.txt")), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Bmp,
    Gif,
    Tiff,
    WebP,
    /// Canon RAW
    Cr2,
}

impl ImageKind {
    /// Determine the image kind from a file path extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "gif" => Some(Self::Gif),
            "tif" | "tiff" => Some(Self::Tiff),
            "webp" => Some(Self::WebP),
            "cr2" => Some(Self::Cr2),
            _ => None,
        }
    }

    /// MIME type sent to the vision model.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Bmp => "image/bmp",
            Self::Gif => "image/gif",
            Self::Tiff => "image/tiff",
            Self::WebP => "image/webp",
            Self::Cr2 => "image/x-canon-cr2",
        }
    }

    /// Codec used by the stripper. `None` for RAW.
    pub fn image_format(&self) -> Option<ImageFormat> {
        match self {
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Png => Some(ImageFormat::Png),
            Self::Bmp => Some(ImageFormat::Bmp),
            Self::Gif => Some(ImageFormat::Gif),
            Self::Tiff => Some(ImageFormat::Tiff),
            Self::WebP => Some(ImageFormat::WebP),
            Self::Cr2 => None,
        }
    }
}

/// A file handed to the tool, held in memory.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    /// Original basename. Directory components are dropped.
    pub name: String,
    pub bytes: Vec<u8>,
    pub kind: Option<ImageKind>,
}

impl UploadedImage {
    pub fn new(name: impl AsRef<str>, bytes: Vec<u8>) -> Self {
        let name = Path::new(name.as_ref())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "upload".to_string());
        let kind = ImageKind::from_path(Path::new(&name));
        Self { name, bytes, kind }
    }

    pub fn from_path(path: &Path) -> Result<Self, ProcessError> {
        let bytes = std::fs::read(path)
            .map_err(|e| ProcessError::io(format!("failed to read {}", path.display()), e))?;
        Ok(Self::new(path.to_string_lossy(), bytes))
    }

    /// MIME type for the model; unknown kinds go out as JPEG.
    pub fn mime_type(&self) -> &'static str {
        self.kind.map(|k| k.mime_type()).unwrap_or("image/jpeg")
    }

    /// Basename without the extension.
    pub fn stem(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Which batch operation produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Tagging,
    Stripping,
}

impl Mode {
    /// Output subdirectory inside the session workspace.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Tagging => "tagged_images",
            Self::Stripping => "stripped_images",
        }
    }

    pub fn archive_name(&self) -> &'static str {
        match self {
            Self::Tagging => "tagged_images.zip",
            Self::Stripping => "stripped_images.zip",
        }
    }
}

/// What happened to one input file.
#[derive(Debug)]
pub struct FileOutcome {
    pub name: String,
    pub result: Result<PathBuf, ProcessError>,
}

impl FileOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// The result of one batch, in input order.
#[derive(Debug)]
pub struct BatchReport {
    pub mode: Mode,
    pub outcomes: Vec<FileOutcome>,
    /// ZIP of all outputs, present when more than one file succeeded.
    pub archive: Option<PathBuf>,
}

impl BatchReport {
    /// Output paths of the successful files, in input order.
    pub fn outputs(&self) -> Vec<&Path> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(PathBuf::as_path))
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let files: Vec<serde_json::Value> = self
            .outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(path) => serde_json::json!({
                    "file": o.name,
                    "ok": true,
                    "output": path.display().to_string(),
                }),
                Err(e) => serde_json::json!({
                    "file": o.name,
                    "ok": false,
                    "kind": e.kind(),
                    "error": e.to_string(),
                }),
            })
            .collect();

        serde_json::json!({
            "mode": self.mode,
            "succeeded": self.succeeded(),
            "failed": self.outcomes.len() - self.succeeded(),
            "archive": self.archive.as_ref().map(|p| p.display().to_string()),
            "files": files,
        })
    }
}

/// One step of a batch: turn an upload into an output file.
#[async_trait::async_trait]
trait FileProcessor: Send + Sync {
    async fn process(
        &self,
        session: &Session,
        image: &UploadedImage,
        output_dir: &Path,
    ) -> Result<PathBuf, ProcessError>;
}

struct Tagger<'a> {
    analyzer: &'a Analyzer,
}

#[async_trait::async_trait]
impl FileProcessor for Tagger<'_> {
    async fn process(
        &self,
        session: &Session,
        image: &UploadedImage,
        output_dir: &Path,
    ) -> Result<PathBuf, ProcessError> {
        // Unwritable formats fail before the model is called.
        metadata::ensure_writable(image)?;
        let record = self.analyzer.analyze(image).await?;
        metadata::write_metadata(session, image, &record, &output_dir.join(&image.name))
    }
}

struct Stripper {
    options: StripOptions,
}

#[async_trait::async_trait]
impl FileProcessor for Stripper {
    async fn process(
        &self,
        session: &Session,
        image: &UploadedImage,
        output_dir: &Path,
    ) -> Result<PathBuf, ProcessError> {
        strip::strip_metadata(session, image, output_dir, &self.options)
    }
}

/// Build the analyzer for the configured provider.
pub fn build_analyzer(config: &Config, api_key: &str) -> Result<Analyzer, ProcessError> {
    let model = ai::build_model(&config.model, api_key)?;
    Ok(Analyzer::new(model, config.retry_policy()))
}

/// Tag every file with model-generated IPTC metadata.
pub async fn run_tagging(
    session: &mut Session,
    files: &[UploadedImage],
    analyzer: &Analyzer,
) -> BatchReport {
    log::info!("Tagging {} file(s) with {}", files.len(), analyzer.model_name());
    run_batch(session, Mode::Tagging, files, &Tagger { analyzer }).await
}

/// Resolve the key, build the analyzer and tag. A configuration problem is
/// recorded against every file instead of being returned.
pub async fn tag_with_key(
    session: &mut Session,
    files: &[UploadedImage],
    config: &Config,
    api_key: Option<&str>,
) -> BatchReport {
    let analyzer = config
        .resolve_api_key(api_key)
        .ok_or_else(|| ProcessError::Config("no API key given".into()))
        .and_then(|key| build_analyzer(config, &key));

    match analyzer {
        Ok(analyzer) => run_tagging(session, files, &analyzer).await,
        Err(e) => {
            log::error!("{e}");
            session.replace_outputs(Vec::new());
            BatchReport {
                mode: Mode::Tagging,
                outcomes: files
                    .iter()
                    .map(|f| FileOutcome {
                        name: f.name.clone(),
                        result: Err(ProcessError::Config(config_message(&e))),
                    })
                    .collect(),
                archive: None,
            }
        }
    }
}

fn config_message(e: &ProcessError) -> String {
    match e {
        ProcessError::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Write a metadata-free copy of every file.
pub async fn run_stripping(
    session: &mut Session,
    files: &[UploadedImage],
    options: &StripOptions,
) -> BatchReport {
    log::info!("Stripping {} file(s)", files.len());
    run_batch(session, Mode::Stripping, files, &Stripper { options: *options }).await
}

async fn run_batch(
    session: &mut Session,
    mode: Mode,
    files: &[UploadedImage],
    processor: &dyn FileProcessor,
) -> BatchReport {
    let output_dir = match session.output_dir(mode) {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("{e}");
            let message = e.to_string();
            session.replace_outputs(Vec::new());
            return BatchReport {
                mode,
                outcomes: files
                    .iter()
                    .map(|f| FileOutcome {
                        name: f.name.clone(),
                        result: Err(ProcessError::io(
                            message.clone(),
                            std::io::Error::other("output directory unavailable"),
                        )),
                    })
                    .collect(),
                archive: None,
            };
        }
    };

    let mut outcomes = Vec::with_capacity(files.len());
    for (i, image) in files.iter().enumerate() {
        log::info!("[{}/{}] {}", i + 1, files.len(), image.name);
        let result = processor.process(session, image, &output_dir).await;
        match &result {
            Ok(path) => log::info!("  Written: {}", path.display()),
            Err(e) => log::error!("  {} failed: {e}", image.name),
        }
        outcomes.push(FileOutcome {
            name: image.name.clone(),
            result,
        });
    }

    let outputs: Vec<PathBuf> = outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().cloned())
        .collect();
    session.replace_outputs(outputs);

    let archive = session.bundle(mode).unwrap_or_else(|e| {
        log::error!("Failed to build {}: {e}", mode.archive_name());
        None
    });

    BatchReport {
        mode,
        outcomes,
        archive,
    }
}

/// Collect supported image files from the given paths.
///
/// Accepts a mix of file paths and directory paths. Directories are walked
/// recursively (following symlinks) and yield files in name order.
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            if ImageKind::from_path(path).is_some() {
                images.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && ImageKind::from_path(p).is_some() {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ModelError, VisionModel};
    use crate::error::FailureKind;
    use image::{DynamicImage, RgbImage};
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 6, image::Rgb([50, 120, 200])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    struct CountingModel(Arc<AtomicU32>);

    #[async_trait::async_trait]
    impl VisionModel for CountingModel {
        fn name(&self) -> &str {
            "Counting"
        }

        async fn generate(
            &self,
            _p: &str,
            _i: &str,
            _m: &str,
        ) -> Result<Option<String>, ModelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(r#"{"caption": "Flag on the green", "keywords": ["golf"]}"#.into()))
        }
    }

    // ── ImageKind ────────────────────────────────────────────────────

    #[test]
    fn image_kind_from_path() {
        assert_eq!(ImageKind::from_path(Path::new("photo.jpg")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("PHOTO.JPEG")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("a.png")), Some(ImageKind::Png));
        assert_eq!(ImageKind::from_path(Path::new("a.bmp")), Some(ImageKind::Bmp));
        assert_eq!(ImageKind::from_path(Path::new("a.gif")), Some(ImageKind::Gif));
        assert_eq!(ImageKind::from_path(Path::new("a.tif")), Some(ImageKind::Tiff));
        assert_eq!(ImageKind::from_path(Path::new("a.tiff")), Some(ImageKind::Tiff));
        assert_eq!(ImageKind::from_path(Path::new("a.webp")), Some(ImageKind::WebP));
        assert_eq!(ImageKind::from_path(Path::new("a.Cr2")), Some(ImageKind::Cr2));
    }

    #[test]
    fn image_kind_unsupported() {
        assert_eq!(ImageKind::from_path(Path::new("doc.pdf")), None);
        assert_eq!(ImageKind::from_path(Path::new("photo.heic")), None);
        assert_eq!(ImageKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn mime_types() {
        assert_eq!(ImageKind::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(ImageKind::Png.mime_type(), "image/png");
        assert_eq!(ImageKind::Cr2.mime_type(), "image/x-canon-cr2");
        assert_eq!(UploadedImage::new("x.unknown", vec![1]).mime_type(), "image/jpeg");
    }

    // ── UploadedImage / Mode ─────────────────────────────────────────

    #[test]
    fn uploaded_image_keeps_only_basename() {
        let image = UploadedImage::new("../../secret/IMG_1.JPG", vec![1, 2]);
        assert_eq!(image.name, "IMG_1.JPG");
        assert_eq!(image.kind, Some(ImageKind::Jpeg));
        assert_eq!(image.stem(), "IMG_1");

        assert_eq!(UploadedImage::new("", vec![]).name, "upload");
    }

    #[test]
    fn uploaded_image_from_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shot.png");
        fs::write(&path, b"bytes").unwrap();

        let image = UploadedImage::from_path(&path).unwrap();
        assert_eq!(image.name, "shot.png");
        assert_eq!(image.bytes, b"bytes");

        let err = UploadedImage::from_path(&dir.path().join("missing.png")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
    }

    #[test]
    fn mode_names() {
        assert_eq!(Mode::Tagging.dir_name(), "tagged_images");
        assert_eq!(Mode::Stripping.archive_name(), "stripped_images.zip");
    }

    // ── batches ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn tagging_skips_model_for_unwritable_formats() {
        let calls = Arc::new(AtomicU32::new(0));
        let analyzer = Analyzer::new(Box::new(CountingModel(calls.clone())), Default::default());
        let mut session = Session::new().unwrap();
        let files = vec![
            UploadedImage::new("a.jpg", encoded(ImageFormat::Jpeg)),
            UploadedImage::new("b.gif", b"GIF89a\x06\x00\x06\x00".to_vec()),
        ];

        let report = run_tagging(&mut session, &files, &analyzer).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.outcomes[0].is_ok());
        let err = report.outcomes[1].result.as_ref().unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnsupportedFormat);
        assert_eq!(session.outputs().len(), 1);
        assert!(report.archive.is_none());
    }

    #[tokio::test]
    async fn tag_without_key_fails_every_file() {
        let mut session = Session::new().unwrap();
        let files = vec![
            UploadedImage::new("a.jpg", encoded(ImageFormat::Jpeg)),
            UploadedImage::new("b.png", encoded(ImageFormat::Png)),
        ];

        let report = tag_with_key(&mut session, &files, &Config::default(), Some("  ")).await;

        assert_eq!(report.outcomes.len(), 2);
        for outcome in &report.outcomes {
            assert_eq!(outcome.result.as_ref().unwrap_err().kind(), FailureKind::Configuration);
        }
        assert!(session.outputs().is_empty());
    }

    #[tokio::test]
    async fn tag_with_bad_provider_is_configuration_failure() {
        let mut session = Session::new().unwrap();
        let mut config = Config::default();
        config.model.provider = "nope".into();
        let files = vec![UploadedImage::new("a.jpg", encoded(ImageFormat::Jpeg))];

        let report = tag_with_key(&mut session, &files, &config, Some("key")).await;
        let err = report.outcomes[0].result.as_ref().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn stripping_batch_keeps_order_and_bundles() {
        let mut session = Session::new().unwrap();
        let files = vec![
            UploadedImage::new("one.png", encoded(ImageFormat::Png)),
            UploadedImage::new("notes.txt", b"text".to_vec()),
            UploadedImage::new("two.bmp", encoded(ImageFormat::Bmp)),
        ];

        let report = run_stripping(&mut session, &files, &StripOptions::default()).await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failures().count(), 1);
        let names: Vec<_> = report
            .outputs()
            .iter()
            .map(|p| p.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["one.png", "two.bmp"]);
        assert_eq!(session.outputs().len(), 2);
        assert!(report.archive.as_ref().unwrap().ends_with("stripped_images.zip"));

        let json = report.to_json();
        assert_eq!(json["mode"], "stripping");
        assert_eq!(json["failed"], 1);
        assert_eq!(json["files"][1]["kind"], "unsupported_format");
    }

    #[tokio::test]
    async fn new_batch_replaces_previous_outputs() {
        let mut session = Session::new().unwrap();
        let first = vec![
            UploadedImage::new("a.png", encoded(ImageFormat::Png)),
            UploadedImage::new("b.png", encoded(ImageFormat::Png)),
        ];
        run_stripping(&mut session, &first, &StripOptions::default()).await;
        assert_eq!(session.outputs().len(), 2);

        let second = vec![UploadedImage::new("c.png", encoded(ImageFormat::Png))];
        let report = run_stripping(&mut session, &second, &StripOptions::default()).await;
        assert_eq!(session.outputs().len(), 1);
        assert!(session.outputs()[0].ends_with("c.png"));
        assert!(report.archive.is_none());
    }

    // ── collect_images ───────────────────────────────────────────────

    #[test]
    fn collect_images_single_file() {
        let dir = TempDir::new().unwrap();
        let jpg = dir.path().join("test.jpg");
        fs::write(&jpg, b"fake").unwrap();

        let images = collect_images(&[jpg.clone()]);
        assert_eq!(images, vec![jpg]);
    }

    #[test]
    fn collect_images_skips_unsupported() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("readme.txt");
        fs::write(&txt, b"text").unwrap();

        assert!(collect_images(&[txt]).is_empty());
    }

    #[test]
    fn collect_images_walks_directories_in_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.png"), b"fake").unwrap();
        fs::write(dir.path().join("a.jpg"), b"fake").unwrap();
        fs::write(dir.path().join("doc.pdf"), b"fake").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("c.CR2"), b"fake").unwrap();

        let images = collect_images(&[dir.path().to_path_buf()]);
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png", "c.CR2"]);
    }

    #[test]
    fn collect_images_nonexistent_path() {
        assert!(collect_images(&[PathBuf::from("/no/such/dir")]).is_empty());
    }
}

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage, RgbaImage};
use metatag::ai::{Analyzer, ModelError, RetryPolicy, VisionModel};
use metatag::metadata::{read_iptc, read_png_text};
use metatag::pipeline::{ImageKind, UploadedImage, run_stripping, run_tagging};
use metatag::session::Session;
use metatag::strip::StripOptions;

struct FixedAnswer;

#[async_trait::async_trait]
impl VisionModel for FixedAnswer {
    fn name(&self) -> &str {
        "Fixed"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _image: &str,
        _mime: &str,
    ) -> Result<Option<String>, ModelError> {
        Ok(Some(
            r#"```json
{"caption": "Bunker shot on the 7th", "keywords": "golf, sand, wedge", "source": "Club archive"}
```"#
                .to_string(),
        ))
    }
}

fn encoded(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

fn analyzer() -> Analyzer {
    Analyzer::new(Box::new(FixedAnswer), RetryPolicy::new(0, Duration::ZERO))
}

#[tokio::test]
async fn tag_then_strip_leaves_no_metadata() {
    let gradient = RgbImage::from_fn(20, 10, |x, y| {
        image::Rgb([x as u8 * 12, y as u8 * 20, 128])
    });
    let jpeg = encoded(DynamicImage::ImageRgb8(gradient), ImageFormat::Jpeg);
    let png = encoded(
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(9, 6, image::Rgba([1, 2, 3, 200]))),
        ImageFormat::Png,
    );
    let files = vec![
        UploadedImage::new("bunker.jpg", jpeg),
        UploadedImage::new("flagstick.png", png),
    ];

    let mut tag_session = Session::new().unwrap();
    let tagged = run_tagging(&mut tag_session, &files, &analyzer()).await;
    assert_eq!(tagged.succeeded(), 2);

    let tagged_files: Vec<UploadedImage> = tagged
        .outputs()
        .iter()
        .map(|p| UploadedImage::from_path(p).unwrap())
        .collect();

    let jpeg_record = read_iptc(&tagged_files[0].bytes).unwrap();
    assert_eq!(jpeg_record.caption.as_deref(), Some("Bunker shot on the 7th"));
    assert_eq!(
        jpeg_record.keywords,
        Some(vec!["golf".to_string(), "sand".to_string(), "wedge".to_string()])
    );
    assert_eq!(jpeg_record.source.as_deref(), Some("Club archive"));
    assert_eq!(read_png_text(&tagged_files[1].bytes).unwrap(), jpeg_record);

    let mut strip_session = Session::new().unwrap();
    let stripped = run_stripping(&mut strip_session, &tagged_files, &StripOptions::default()).await;
    assert_eq!(stripped.succeeded(), 2);
    assert!(stripped.archive.is_some());

    let outputs = stripped.outputs();
    let clean_jpeg = std::fs::read(outputs[0]).unwrap();
    assert!(!read_iptc(&clean_jpeg).unwrap().has_any());
    let img = image::load_from_memory_with_format(&clean_jpeg, ImageFormat::Jpeg).unwrap();
    assert_eq!(img.dimensions(), (20, 10));
    assert_eq!(img.color(), image::ColorType::Rgb8);

    let clean_png = std::fs::read(outputs[1]).unwrap();
    assert!(!read_png_text(&clean_png).unwrap().has_any());
    let img = image::load_from_memory_with_format(&clean_png, ImageFormat::Png).unwrap();
    assert_eq!(img.dimensions(), (9, 6));
    assert_eq!(img.color(), image::ColorType::Rgba8);
    assert_eq!(img.to_rgba8().get_pixel(4, 3), &image::Rgba([1, 2, 3, 200]));
}

#[tokio::test]
async fn stripping_keeps_names_and_kinds() {
    let bmp = encoded(DynamicImage::ImageRgb8(RgbImage::new(3, 3)), ImageFormat::Bmp);
    let files = vec![UploadedImage::new("/uploads/tmp/scorecard.bmp", bmp)];

    let mut session = Session::new().unwrap();
    let report = run_stripping(&mut session, &files, &StripOptions::default()).await;

    let outputs = report.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].file_name().unwrap(), "scorecard.bmp");
    assert_eq!(ImageKind::from_path(outputs[0]), Some(ImageKind::Bmp));
    assert!(outputs[0].starts_with(session.workspace()));
}

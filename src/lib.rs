//! # metatag
//!
//! AI-assisted IPTC tagging and metadata stripping for images. A vision model
//! (Google Gemini or OpenAI) proposes a caption, keywords, by-line, credit and
//! source for each photo, and the result is embedded into a copy of the file.
//! The stripper does the opposite, re-encoding images so no metadata survives,
//! and develops Canon RAW (`.cr2`) files into clean JPEGs.
//!
//! ## Quick Start
//!
//! Batches run inside a [`session::Session`], which owns a private workspace
//! and bundles multi-file results into a ZIP archive:
//!
//! ```rust,no_run
//! use metatag::config::Config;
//! use metatag::pipeline::{collect_images, tag_with_key, UploadedImage};
//! use metatag::session::Session;
//! use std::path::{Path, PathBuf};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some(Path::new("config.json")))?;
//!
//!     let files = collect_images(&[PathBuf::from("./photos")])
//!         .iter()
//!         .map(|p| UploadedImage::from_path(p))
//!         .collect::<Result<Vec<_>, _>>()?;
//!
//!     let mut session = Session::new()?;
//!     let report = tag_with_key(&mut session, &files, &config, None).await;
//!
//!     for outcome in &report.outcomes {
//!         match &outcome.result {
//!             Ok(path) => println!("Tagged: {}", path.display()),
//!             Err(e) => eprintln!("{}: {e}", outcome.name),
//!         }
//!     }
//!     if let Some(archive) = &report.archive {
//!         println!("Archive: {}", archive.display());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-Level Usage
//!
//! The metadata writers work on in-memory bytes:
//!
//! ```rust,no_run
//! use metatag::ai::MetadataRecord;
//! use metatag::metadata::{read_iptc, write_iptc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let bytes = std::fs::read("photo.jpg")?;
//! let record = MetadataRecord {
//!     caption: Some("Golfer lining up a putt".into()),
//!     keywords: Some(vec!["golf".into(), "putting".into()]),
//!     ..Default::default()
//! };
//! let tagged = write_iptc(&bytes, &record)?;
//! assert_eq!(read_iptc(&tagged)?.caption, record.caption);
//! # Ok(())
//! # }
//! ```
//!
//! ## Supported Formats
//!
//! | Format | Tagging | Stripping |
//! |--------|---------|-----------|
//! | JPEG (`.jpg`, `.jpeg`) | IPTC-IIM in APP13 | Re-encoded at quality 75 |
//! | PNG (`.png`) | `tEXt` / `iTXt` chunks | Re-encoded |
//! | BMP, GIF, TIFF, WebP | Rejected | Re-encoded |
//! | Canon RAW (`.cr2`) | Rejected | Developed to JPEG (`raw` feature) |
//!
//! ## Modules
//!
//! - [`ai`]: vision model trait, Gemini and OpenAI clients, retry policy
//! - [`config`]: configuration types and loading/saving
//! - [`error`]: per-file error type and failure classification
//! - [`metadata`]: IPTC and PNG text reading and writing
//! - [`pipeline`]: batch orchestration, uploads, image collection
//! - [`session`]: per-batch workspace, scratch files and ZIP bundling
//! - [`strip`]: metadata removal and RAW development

pub mod ai;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod session;
pub mod strip;

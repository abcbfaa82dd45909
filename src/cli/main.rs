use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use metatag::ai::MetadataRecord;
use metatag::pipeline::{self, BatchReport, ImageKind, UploadedImage};
use metatag::session::Session;
use metatag::{config, metadata};

#[derive(Parser, Debug)]
#[command(
    name = "metatag",
    version,
    about = "AI-generated IPTC captions and keywords for photos, and metadata stripping (including Canon RAW)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate caption, keywords, by-line, credit and source with a vision model
    Tag {
        /// Image files or directories (JPEG and PNG are tagged)
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// API key for the configured model provider
        #[arg(long, env = "METATAG_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Write copies with all metadata removed (CR2 becomes JPEG)
    Strip {
        /// Image files or directories
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Print the IPTC / PNG text fields of images
    Show {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },

    /// Write a default config.json and exit
    Init,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Directory that receives the results
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    out: PathBuf,

    /// Deliver the ZIP archive instead of individual files (when more than one file succeeded)
    #[arg(long)]
    zip: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    match &cli.command {
        Command::Init => {
            let config = config::Config::default();
            let path = cli.config.as_deref();
            config.save(path)?;
            let save_path = match path {
                Some(p) => p.to_path_buf(),
                None => config::Config::config_path()?,
            };
            println!("Default config written to {}", save_path.display());
            Ok(())
        }
        Command::Show { paths } => show(paths, cli.json),
        Command::Tag {
            paths,
            api_key,
            output,
        } => {
            let config = config::Config::load(cli.config.as_deref())?;
            let files = load_images(paths)?;
            let mut session = Session::new()?;
            let report =
                pipeline::tag_with_key(&mut session, &files, &config, api_key.as_deref()).await;
            finish(session, &report, output, &config, cli.json)
        }
        Command::Strip { paths, output } => {
            let config = config::Config::load(cli.config.as_deref())?;
            let files = load_images(paths)?;
            let mut session = Session::new()?;
            let report =
                pipeline::run_stripping(&mut session, &files, &config.strip_options()).await;
            finish(session, &report, output, &config, cli.json)
        }
    }
}

/// Read every supported image under `paths` into memory.
fn load_images(paths: &[PathBuf]) -> Result<Vec<UploadedImage>> {
    let images = pipeline::collect_images(paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }
    log::info!("Found {} image(s) to process", images.len());

    let mut files = Vec::with_capacity(images.len());
    for path in &images {
        match UploadedImage::from_path(path) {
            Ok(file) => files.push(file),
            Err(e) => log::error!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(files)
}

/// Copy results out of the session, report, then clean up.
fn finish(
    mut session: Session,
    report: &BatchReport,
    output: &OutputArgs,
    config: &config::Config,
    json: bool,
) -> Result<()> {
    let delivered = deliver(report, output)?;

    if json {
        let mut value = report.to_json();
        value["delivered"] = serde_json::json!(
            delivered.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()
        );
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for path in &delivered {
            println!("{GREEN}✓{RESET} {}", path.display());
        }
        for failure in report.failures() {
            if let Err(e) = &failure.result {
                println!("{RED}✗{RESET} {} {DIM}({e}){RESET}", failure.name);
            }
        }
    }

    let total = report.outcomes.len();
    let success = report.succeeded();
    log::info!("Done: {success} succeeded, {} failed out of {total} images", total - success);

    if config.output.keep_workspace {
        let kept = session.into_kept_path();
        log::info!("Workspace kept at {}", kept.display());
    } else {
        session.clear_outputs();
    }

    if total > 0 && success == 0 {
        anyhow::bail!("No files were processed successfully.");
    }
    Ok(())
}

/// Copy the archive or the individual outputs into `--out`.
fn deliver(report: &BatchReport, output: &OutputArgs) -> Result<Vec<PathBuf>> {
    let outputs = report.outputs();
    if outputs.is_empty() {
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(&output.out)
        .with_context(|| format!("Failed to create {}", output.out.display()))?;

    let sources: Vec<&Path> = match (&report.archive, output.zip) {
        (Some(archive), true) => vec![archive.as_path()],
        (None, true) => {
            log::info!("Only one file succeeded, delivering it without an archive");
            outputs
        }
        (_, false) => outputs,
    };

    let mut delivered = Vec::with_capacity(sources.len());
    for src in sources {
        let name = src.file_name().context("Output has no file name")?;
        let dest = output.out.join(name);
        std::fs::copy(src, &dest)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
        delivered.push(dest);
    }
    Ok(delivered)
}

fn show(paths: &[PathBuf], json: bool) -> Result<()> {
    let images = pipeline::collect_images(paths);
    if images.is_empty() {
        anyhow::bail!("No supported image files found in the specified paths.");
    }

    let mut entries = Vec::new();
    for path in &images {
        let Some(kind) = ImageKind::from_path(path) else {
            continue;
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = match kind {
            ImageKind::Jpeg | ImageKind::Png => metadata::read_metadata(kind, &bytes)
                .with_context(|| format!("Failed to read metadata from {}", path.display()))?,
            _ => {
                log::warn!("{}: only JPEG and PNG carry readable tags", path.display());
                MetadataRecord::default()
            }
        };

        if json {
            entries.push(serde_json::json!({
                "path": path.display().to_string(),
                "metadata": record,
            }));
        } else {
            print_record(path, &record);
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    }
    Ok(())
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Two-column label/value listing with wrapped values.
struct Table {
    label_width: usize,
    value_width: usize,
}

impl Table {
    const FIELDS: [&'static str; 5] = ["Caption", "Keywords", "By-line", "Credit", "Source"];

    fn new(total_width: usize) -> Self {
        let label_width = Self::FIELDS.iter().map(|f| f.len()).max().unwrap_or(0);
        // "  " + label + " : "
        let value_width = total_width.saturating_sub(label_width + 5).max(16);
        Self {
            label_width,
            value_width,
        }
    }

    fn row(&self, label: &str, value: &str) {
        for (i, line) in wrap(value, self.value_width).iter().enumerate() {
            let label = if i == 0 { label } else { "" };
            let sep = if label.is_empty() { " " } else { ":" };
            println!("  {label:<width$} {sep} {line}", width = self.label_width);
        }
    }

    fn list(&self, label: &str, items: &[String]) {
        for (i, item) in items.iter().enumerate() {
            self.row(if i == 0 { label } else { "" }, &format!("- {item}"));
        }
    }
}

/// Print the descriptive fields of one file.
fn print_record(path: &Path, record: &MetadataRecord) {
    let table = Table::new(72);
    println!();
    println!("{BOLD}{}{RESET}", path.display());
    println!("{DIM}{}{RESET}", "─".repeat(72));

    if !record.has_any() {
        println!("  {DIM}no caption, keywords or credits{RESET}");
        return;
    }

    let [caption, keywords, byline, credit, source] = Table::FIELDS;
    if let Some(v) = &record.caption {
        table.row(caption, v);
    }
    if let Some(k) = &record.keywords {
        table.list(keywords, k);
    }
    let credits = [
        (byline, &record.byline),
        (credit, &record.credit),
        (source, &record.source),
    ];
    for (label, value) in credits {
        if let Some(v) = value {
            table.row(label, v);
        }
    }
}

/// Greedy word wrap counted in chars. Words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut len = 0;

    for word in text.split_whitespace() {
        let mut chars: Vec<char> = word.chars().collect();
        while chars.len() > width {
            if len > 0 {
                lines.push(std::mem::take(&mut line));
                len = 0;
            }
            let rest = chars.split_off(width);
            lines.push(chars.into_iter().collect());
            chars = rest;
        }
        if len > 0 && len + 1 + chars.len() > width {
            lines.push(std::mem::take(&mut line));
            len = 0;
        }
        if len > 0 {
            line.push(' ');
            len += 1;
        }
        len += chars.len();
        line.extend(chars);
    }
    if len > 0 || lines.is_empty() {
        lines.push(line);
    }
    lines
}

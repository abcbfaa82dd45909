//! PNG textual chunks (`tEXt` / `iTXt`).

use img_parts::Bytes;
use img_parts::png::{Png, PngChunk};

use crate::ai::MetadataRecord;
use crate::error::ProcessError;

const TEXT: [u8; 4] = *b"tEXt";
const ITXT: [u8; 4] = *b"iTXt";
const IDAT: [u8; 4] = *b"IDAT";

const CAPTION: &str = "caption";
const KEYWORDS: &str = "keywords";
const BYLINE: &str = "byline";
const CREDIT: &str = "credit";
const SOURCE: &str = "source";

/// Embed `record` as text chunks, returning the new file bytes.
///
/// Existing text chunks with the same keyword are dropped; new chunks go in
/// front of the first `IDAT`. Values that fit in Latin-1 are written as
/// `tEXt`, anything else as uncompressed `iTXt`.
pub fn write_png_text(png_bytes: &[u8], record: &MetadataRecord) -> Result<Vec<u8>, ProcessError> {
    let mut png = Png::from_bytes(Bytes::copy_from_slice(png_bytes))
        .map_err(|e| ProcessError::Codec(format!("not a valid PNG: {e}")))?;

    let keywords = record.keywords.as_ref().map(|k| k.join(", "));
    let entries: Vec<(&str, &str)> = [
        (CAPTION, record.caption.as_deref()),
        (KEYWORDS, keywords.as_deref()),
        (BYLINE, record.byline.as_deref()),
        (CREDIT, record.credit.as_deref()),
        (SOURCE, record.source.as_deref()),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|v| (key, v)))
    .collect();

    let chunks = png.chunks_mut();
    chunks.retain(|chunk| {
        text_keyword(chunk).is_none_or(|key| !entries.iter().any(|(k, _)| *k == key))
    });

    let insert_at = chunks
        .iter()
        .position(|c| c.kind() == IDAT)
        .ok_or_else(|| ProcessError::Codec("PNG has no IDAT chunk".into()))?;

    for (offset, (key, value)) in entries.iter().enumerate() {
        log::debug!("  PNG text chunk {key}: {} bytes", value.len());
        chunks.insert(insert_at + offset, text_chunk(key, value));
    }

    Ok(png.encoder().bytes().to_vec())
}

/// Read the known text chunks back. Compressed chunks are skipped.
pub fn read_png_text(png_bytes: &[u8]) -> Result<MetadataRecord, ProcessError> {
    let png = Png::from_bytes(Bytes::copy_from_slice(png_bytes))
        .map_err(|e| ProcessError::Codec(format!("not a valid PNG: {e}")))?;

    let mut record = MetadataRecord::default();
    for chunk in png.chunks() {
        let Some((key, value)) = decode_text(chunk) else {
            continue;
        };
        match key.as_str() {
            CAPTION => record.caption = Some(value),
            KEYWORDS => {
                record.keywords = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                )
            }
            BYLINE => record.byline = Some(value),
            CREDIT => record.credit = Some(value),
            SOURCE => record.source = Some(value),
            _ => {}
        }
    }
    Ok(record)
}

fn text_chunk(key: &str, value: &str) -> PngChunk {
    match to_latin1(value) {
        Some(latin1) => {
            let mut data = Vec::with_capacity(key.len() + 1 + latin1.len());
            data.extend_from_slice(key.as_bytes());
            data.push(0);
            data.extend(latin1);
            PngChunk::new(TEXT, Bytes::from(data))
        }
        None => {
            // keyword \0 flag method language \0 translated \0 text
            let mut data = Vec::with_capacity(key.len() + 5 + value.len());
            data.extend_from_slice(key.as_bytes());
            data.extend_from_slice(&[0, 0, 0, 0, 0]);
            data.extend_from_slice(value.as_bytes());
            PngChunk::new(ITXT, Bytes::from(data))
        }
    }
}

fn to_latin1(value: &str) -> Option<Vec<u8>> {
    value
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect()
}

/// Keyword of a `tEXt`/`iTXt` chunk, if it is one.
fn text_keyword(chunk: &PngChunk) -> Option<String> {
    let kind = chunk.kind();
    if kind != TEXT && kind != ITXT {
        return None;
    }
    let contents = chunk.contents();
    let end = contents.iter().position(|b| *b == 0)?;
    Some(contents[..end].iter().map(|b| *b as char).collect())
}

fn decode_text(chunk: &PngChunk) -> Option<(String, String)> {
    let key = text_keyword(chunk)?;
    let contents = chunk.contents();
    let key_end = contents.iter().position(|b| *b == 0)?;
    let rest = &contents[key_end + 1..];

    if chunk.kind() == TEXT {
        return Some((key, rest.iter().map(|b| *b as char).collect()));
    }

    let (&compressed, rest) = rest.split_first()?;
    if compressed != 0 {
        log::debug!("Skipping compressed iTXt chunk {key}");
        return None;
    }
    let rest = rest.get(1..)?;
    let lang_end = rest.iter().position(|b| *b == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|b| *b == 0)?;
    let text = String::from_utf8_lossy(&rest[translated_end + 1..]).into_owned();
    Some((key, text))
}

//! IPTC-IIM inside a JPEG APP13 "Photoshop 3.0" segment.
//!
//! The IIM block lives in 8BIM image resource 0x0404. Everything else in the
//! segment (other resources, datasets we don't manage) is carried over
//! untouched.

use img_parts::Bytes;
use img_parts::jpeg::{Jpeg, JpegSegment};

use crate::ai::MetadataRecord;
use crate::error::ProcessError;

const APP13: u8 = 0xED;
const PHOTOSHOP_HEADER: &[u8] = b"Photoshop 3.0\0";
const RESOURCE_SIGNATURE: &[u8] = b"8BIM";
const IPTC_RESOURCE_ID: u16 = 0x0404;
const TAG_MARKER: u8 = 0x1C;

/// Largest payload a JPEG segment can carry (length field minus itself).
const MAX_SEGMENT_CONTENTS: usize = 65533;

/// ESC % G, the ISO 2022 escape announcing UTF-8.
const UTF8_CHARSET: &[u8] = b"\x1B%G";

/// Record/dataset numbers and byte limits of the fields we write.
mod dataset {
    pub const CODED_CHARACTER_SET: (u8, u8) = (1, 90);
    pub const RECORD_VERSION: (u8, u8) = (2, 0);
    pub const KEYWORDS: (u8, u8) = (2, 25);
    pub const BYLINE: (u8, u8) = (2, 80);
    pub const CREDIT: (u8, u8) = (2, 110);
    pub const SOURCE: (u8, u8) = (2, 115);
    pub const CAPTION: (u8, u8) = (2, 120);

    pub const KEYWORD_MAX: usize = 64;
    pub const BYLINE_MAX: usize = 32;
    pub const CREDIT_MAX: usize = 32;
    pub const SOURCE_MAX: usize = 32;
    pub const CAPTION_MAX: usize = 2000;
}

/// One IIM dataset: `0x1C record number length data`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Dataset {
    record: u8,
    number: u8,
    data: Vec<u8>,
}

impl Dataset {
    fn new((record, number): (u8, u8), data: impl Into<Vec<u8>>) -> Self {
        Self {
            record,
            number,
            data: data.into(),
        }
    }

    fn is(&self, (record, number): (u8, u8)) -> bool {
        self.record == record && self.number == number
    }
}

/// One 8BIM image resource. `name` keeps the raw Pascal string with its
/// padding so it can be written back byte for byte.
#[derive(Debug, Clone)]
struct Resource {
    id: u16,
    name: Vec<u8>,
    data: Vec<u8>,
}

/// Embed `record` in a JPEG, returning the new file bytes.
///
/// Only datasets for fields present in `record` are replaced. Keywords are
/// replaced as a group, one dataset per keyword.
pub fn write_iptc(jpeg_bytes: &[u8], record: &MetadataRecord) -> Result<Vec<u8>, ProcessError> {
    let mut jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(jpeg_bytes))
        .map_err(|e| ProcessError::Codec(format!("not a valid JPEG: {e}")))?;

    let app13_pos = jpeg
        .segments()
        .iter()
        .position(|s| s.marker() == APP13 && s.contents().starts_with(PHOTOSHOP_HEADER));

    let mut resources = app13_pos
        .map(|pos| parse_resources(&jpeg.segments()[pos].contents()[PHOTOSHOP_HEADER.len()..]))
        .unwrap_or_default();

    let iptc_index = resources.iter().position(|r| r.id == IPTC_RESOURCE_ID);
    let mut datasets = iptc_index
        .map(|i| parse_datasets(&resources[i].data))
        .unwrap_or_default();

    apply_record(&mut datasets, record);
    let iim = encode_datasets(&datasets);

    match iptc_index {
        Some(i) => resources[i].data = iim,
        None => resources.push(Resource {
            id: IPTC_RESOURCE_ID,
            name: vec![0, 0],
            data: iim,
        }),
    }

    let mut contents = PHOTOSHOP_HEADER.to_vec();
    contents.extend(encode_resources(&resources));
    if contents.len() > MAX_SEGMENT_CONTENTS {
        return Err(ProcessError::Codec(format!(
            "IPTC block is {} bytes, more than one APP13 segment can hold",
            contents.len()
        )));
    }

    let segment = JpegSegment::new_with_contents(APP13, Bytes::from(contents));
    let segments = jpeg.segments_mut();
    match app13_pos {
        Some(pos) => segments[pos] = segment,
        None => {
            let insert_at = segments
                .iter()
                .position(|s| !(0xE0..=0xEF).contains(&s.marker()))
                .unwrap_or(segments.len());
            segments.insert(insert_at, segment);
        }
    }

    Ok(jpeg.encoder().bytes().to_vec())
}

/// Read caption, keywords, by-line, credit, and source back from a JPEG.
/// A JPEG without an IPTC block yields an empty record.
pub fn read_iptc(jpeg_bytes: &[u8]) -> Result<MetadataRecord, ProcessError> {
    let jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(jpeg_bytes))
        .map_err(|e| ProcessError::Codec(format!("not a valid JPEG: {e}")))?;

    let datasets: Vec<Dataset> = jpeg
        .segments()
        .iter()
        .filter(|s| s.marker() == APP13 && s.contents().starts_with(PHOTOSHOP_HEADER))
        .flat_map(|s| parse_resources(&s.contents()[PHOTOSHOP_HEADER.len()..]))
        .filter(|r| r.id == IPTC_RESOURCE_ID)
        .flat_map(|r| parse_datasets(&r.data))
        .collect();

    let text = |id: (u8, u8)| {
        datasets
            .iter()
            .find(|d| d.is(id))
            .map(|d| String::from_utf8_lossy(&d.data).into_owned())
    };
    let keywords: Vec<String> = datasets
        .iter()
        .filter(|d| d.is(dataset::KEYWORDS))
        .map(|d| String::from_utf8_lossy(&d.data).into_owned())
        .collect();

    Ok(MetadataRecord {
        caption: text(dataset::CAPTION),
        keywords: if keywords.is_empty() { None } else { Some(keywords) },
        byline: text(dataset::BYLINE),
        credit: text(dataset::CREDIT),
        source: text(dataset::SOURCE),
    })
}

fn apply_record(datasets: &mut Vec<Dataset>, record: &MetadataRecord) {
    let mut replace = |id: (u8, u8), values: Vec<Dataset>| {
        datasets.retain(|d| !d.is(id));
        datasets.extend(values);
    };

    let single = |id: (u8, u8), value: &Option<String>, max: usize| {
        value
            .as_deref()
            .map(|v| vec![Dataset::new(id, truncate_utf8(v, max))])
    };

    if let Some(values) = single(dataset::CAPTION, &record.caption, dataset::CAPTION_MAX) {
        replace(dataset::CAPTION, values);
    }
    if let Some(keywords) = &record.keywords {
        let values = keywords
            .iter()
            .map(|k| Dataset::new(dataset::KEYWORDS, truncate_utf8(k, dataset::KEYWORD_MAX)))
            .collect();
        replace(dataset::KEYWORDS, values);
    }
    if let Some(values) = single(dataset::BYLINE, &record.byline, dataset::BYLINE_MAX) {
        replace(dataset::BYLINE, values);
    }
    if let Some(values) = single(dataset::CREDIT, &record.credit, dataset::CREDIT_MAX) {
        replace(dataset::CREDIT, values);
    }
    if let Some(values) = single(dataset::SOURCE, &record.source, dataset::SOURCE_MAX) {
        replace(dataset::SOURCE, values);
    }

    replace(
        dataset::CODED_CHARACTER_SET,
        vec![Dataset::new(dataset::CODED_CHARACTER_SET, UTF8_CHARSET)],
    );
    if !datasets.iter().any(|d| d.is(dataset::RECORD_VERSION)) {
        datasets.push(Dataset::new(dataset::RECORD_VERSION, [0x00u8, 0x04]));
    }

    // Readers expect records in ascending order; the sort is stable so
    // repeated datasets (keywords) keep their order.
    datasets.sort_by_key(|d| (d.record, d.number));
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a character.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn parse_datasets(data: &[u8]) -> Vec<Dataset> {
    let mut datasets = Vec::new();
    let mut pos = 0;

    while pos + 5 <= data.len() && data[pos] == TAG_MARKER {
        let record = data[pos + 1];
        let number = data[pos + 2];
        let raw_len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as usize;
        pos += 5;

        // Extended dataset: the low 15 bits give the size of the length field.
        let len = if raw_len & 0x8000 != 0 {
            let width = raw_len & 0x7FFF;
            if width == 0 || width > data.len() - pos {
                break;
            }
            let len = data[pos..pos + width]
                .iter()
                .try_fold(0usize, |acc, b| acc.checked_mul(256)?.checked_add(*b as usize));
            let Some(len) = len else {
                log::debug!("Oversized IIM dataset {record}:{number}, dropping the rest");
                break;
            };
            pos += width;
            len
        } else {
            raw_len
        };

        if len > data.len() - pos {
            log::debug!("Truncated IIM dataset {record}:{number}, dropping the rest");
            break;
        }
        datasets.push(Dataset {
            record,
            number,
            data: data[pos..pos + len].to_vec(),
        });
        pos += len;
    }

    datasets
}

fn encode_datasets(datasets: &[Dataset]) -> Vec<u8> {
    let mut out = Vec::new();
    for d in datasets {
        out.extend_from_slice(&[TAG_MARKER, d.record, d.number]);
        if d.data.len() <= 0x7FFF {
            out.extend_from_slice(&(d.data.len() as u16).to_be_bytes());
        } else {
            out.extend_from_slice(&0x8004u16.to_be_bytes());
            out.extend_from_slice(&(d.data.len() as u32).to_be_bytes());
        }
        out.extend_from_slice(&d.data);
    }
    out
}

fn parse_resources(data: &[u8]) -> Vec<Resource> {
    let mut resources = Vec::new();
    let mut pos = 0;

    while pos + 12 <= data.len() && &data[pos..pos + 4] == RESOURCE_SIGNATURE {
        let id = u16::from_be_bytes([data[pos + 4], data[pos + 5]]);
        // Pascal string, padded so length byte + string is even
        let name_len = data[pos + 6] as usize;
        let name_padded = (name_len + 2) & !1;
        let name_start = pos + 6;
        let size_start = name_start + name_padded;
        if size_start + 4 > data.len() {
            break;
        }
        let size = u32::from_be_bytes([
            data[size_start],
            data[size_start + 1],
            data[size_start + 2],
            data[size_start + 3],
        ]) as usize;
        let data_start = size_start + 4;
        if size > data.len() - data_start {
            break;
        }

        resources.push(Resource {
            id,
            name: data[name_start..size_start].to_vec(),
            data: data[data_start..data_start + size].to_vec(),
        });
        pos = data_start + size + (size % 2);
    }

    resources
}

fn encode_resources(resources: &[Resource]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in resources {
        out.extend_from_slice(RESOURCE_SIGNATURE);
        out.extend_from_slice(&r.id.to_be_bytes());
        out.extend_from_slice(&r.name);
        out.extend_from_slice(&(r.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&r.data);
        if r.data.len() % 2 != 0 {
            out.push(0);
        }
    }
    out
}

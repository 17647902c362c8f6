// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Metadata extraction from image containers
//!
//! PNG files carry generation data in `tEXt`/`zTXt`/`iTXt` chunks (ComfyUI
//! writes `prompt` and `workflow`, A1111 writes `parameters`). JPEG and WebP
//! files carry it in the EXIF `UserComment`. A structurally valid image with
//! no such block is not an error: it yields [`RawMetadata::Absent`].

use image::ImageFormat;
use regex::Regex;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use super::{parameters, ImageRecord, RawMetadata};
use crate::{Result, SorterError};

/// Keywords tried first, in order of preference
const PREFERRED_KEYWORDS: &[&str] = &["prompt", "parameters"];

/// A keyword/text pair pulled out of the container
type TextChunk = (String, String);

/// Read an image's header and embedded metadata
///
/// Fails with `UnreadableImage` when the file is not a decodable image;
/// missing or malformed metadata never fails.
pub fn extract(path: &Path) -> Result<ImageRecord> {
    let size = std::fs::metadata(path)
        .map_err(|e| SorterError::io(path, e))?
        .len();

    let reader = image::ImageReader::open(path)
        .map_err(|e| SorterError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| SorterError::io(path, e))?;

    let format = reader
        .format()
        .ok_or_else(|| SorterError::unreadable(path, "unrecognized image container"))?;

    // Reading the dimensions validates the header without decoding pixels
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| SorterError::unreadable(path, e))?;
    debug!("{:?}: {:?} {}x{}", path, format, width, height);

    let chunks = match format {
        ImageFormat::Png => read_png_text(path),
        ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Tiff => read_exif_text(path),
        _ => Ok(Vec::new()),
    };

    let chunks = chunks.unwrap_or_else(|e| {
        debug!("No readable text block in {:?}: {}", path, e);
        Vec::new()
    });

    Ok(ImageRecord::new(path.to_path_buf(), size, Some(format), interpret_chunks(&chunks)))
}

fn read_png_text(path: &Path) -> Result<Vec<TextChunk>> {
    let file = File::open(path).map_err(|e| SorterError::io(path, e))?;
    let decoder = png::Decoder::new(BufReader::new(file));
    let mut reader = decoder
        .read_info()
        .map_err(|e| SorterError::unreadable(path, e))?;
    // Text chunks may also follow the image data; read through to IEND
    if let Err(e) = reader.finish() {
        debug!("Stopped before IEND in {:?}: {}", path, e);
    }
    let info = reader.info();

    let mut chunks = Vec::new();
    for t in &info.uncompressed_latin1_text {
        chunks.push((t.keyword.clone(), t.text.clone()));
    }
    for t in &info.compressed_latin1_text {
        match t.get_text() {
            Ok(text) => chunks.push((t.keyword.clone(), text)),
            Err(e) => debug!("Skipping zTXt '{}' in {:?}: {}", t.keyword, path, e),
        }
    }
    for t in &info.utf8_text {
        match t.get_text() {
            Ok(text) => chunks.push((t.keyword.clone(), text)),
            Err(e) => debug!("Skipping iTXt '{}' in {:?}: {}", t.keyword, path, e),
        }
    }
    Ok(chunks)
}

fn read_exif_text(path: &Path) -> Result<Vec<TextChunk>> {
    let file = File::open(path).map_err(|e| SorterError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| SorterError::unreadable(path, e))?;

    let mut chunks = Vec::new();
    for field in exif.fields() {
        let text = match (field.tag, &field.value) {
            (exif::Tag::UserComment, exif::Value::Undefined(bytes, _)) => decode_user_comment(bytes),
            (exif::Tag::UserComment, exif::Value::Ascii(parts))
            | (exif::Tag::ImageDescription, exif::Value::Ascii(parts)) => parts
                .first()
                .map(|b| String::from_utf8_lossy(b).trim_end_matches('\0').to_string()),
            _ => None,
        };
        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
            chunks.push((field.tag.to_string(), text));
        }
    }
    Ok(chunks)
}

/// EXIF UserComment: 8-byte charset prefix, then the payload
fn decode_user_comment(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 8 {
        return None;
    }
    let (prefix, body) = bytes.split_at(8);
    let text = if prefix.starts_with(b"UNICODE") {
        // ASCII text has a zero high byte: big-endian starts with 0x00
        let big_endian = body.first() == Some(&0);
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|c| if big_endian { u16::from_be_bytes([c[0], c[1]]) } else { u16::from_le_bytes([c[0], c[1]]) })
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    Some(text.trim_end_matches('\0').trim().to_string())
}

/// Pick the most useful chunk and interpret it
fn interpret_chunks(chunks: &[TextChunk]) -> RawMetadata {
    if chunks.is_empty() {
        return RawMetadata::Absent;
    }

    let preferred = PREFERRED_KEYWORDS.iter().filter_map(|kw| {
        chunks.iter().find(|(k, _)| k.eq_ignore_ascii_case(kw))
    });
    let others = chunks
        .iter()
        .filter(|(k, _)| !PREFERRED_KEYWORDS.iter().any(|kw| k.eq_ignore_ascii_case(kw)));

    for (_, text) in preferred.chain(others) {
        if let structured @ RawMetadata::Structured(_) = parse_text_block(text) {
            return structured;
        }
    }

    let joined = chunks
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    RawMetadata::RawText(joined)
}

/// Interpret one text block: JSON object, A1111 parameters, or raw text
pub fn parse_text_block(text: &str) -> RawMetadata {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return RawMetadata::Absent;
    }

    if trimmed.starts_with('{') {
        if let Some(map) = parse_json_object(trimmed) {
            return RawMetadata::Structured(map);
        }
    }

    if let Some(map) = parameters::parse(trimmed) {
        return RawMetadata::Structured(map);
    }

    RawMetadata::RawText(trimmed.to_string())
}

/// JSON object parse with one lenient retry
///
/// Python's `json.dumps` emits bare `NaN`/`Infinity`, which strict JSON
/// rejects; those tokens are nulled before the second attempt.
fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(_) => {
            let cleaned = non_finite_regex().replace_all(text, "null");
            match serde_json::from_str::<Value>(&cleaned) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }
        }
    }
}

fn non_finite_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\bInfinity\b|\bNaN\b").expect("valid non-finite regex"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write a small RGB PNG with the given text chunks
    pub(crate) fn write_png(path: &Path, rgb: [u8; 3], size: u32, chunks: &[(&str, &str)]) -> PathBuf {
        let file = File::create(path).unwrap();
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), size, size);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        for (keyword, text) in chunks {
            encoder.add_text_chunk(keyword.to_string(), text.to_string()).unwrap();
        }
        let mut writer = encoder.write_header().unwrap();
        let data: Vec<u8> = (0..size * size).flat_map(|_| rgb).collect();
        writer.write_image_data(&data).unwrap();
        writer.finish().unwrap();
        path.to_path_buf()
    }

    #[test]
    fn test_png_without_metadata_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(&dir.path().join("plain.png"), [10, 20, 30], 4, &[]);
        let record = extract(&path).unwrap();
        assert!(record.metadata.is_absent());
        assert_eq!(record.format, Some(ImageFormat::Png));
        assert!(record.size > 0);
    }

    #[test]
    fn test_png_prompt_chunk_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let graph = r#"{"4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "ponyV6.safetensors"}}}"#;
        let path = write_png(&dir.path().join("comfy.png"), [0, 0, 0], 2, &[("prompt", graph)]);
        let record = extract(&path).unwrap();
        match record.metadata {
            RawMetadata::Structured(map) => assert!(map.contains_key("4")),
            other => panic!("expected structured metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_text_after_image_data_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.png");
        let file = File::create(&path).unwrap();
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), 2, 2);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[0u8; 12]).unwrap();
        let chunk = png::text_metadata::TEXtChunk::new("parameters", "a cat\nSteps: 20, Model: fluxDev");
        writer.write_text_chunk(&chunk).unwrap();
        writer.finish().unwrap();

        match extract(&path).unwrap().metadata {
            RawMetadata::Structured(map) => assert!(map.values().any(|v| v == "fluxDev")),
            other => panic!("expected structured metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"\x89PNG\r\n\x1a\nthis is not a png").unwrap();
        let err = extract(&path).unwrap_err();
        assert!(matches!(err, SorterError::UnreadableImage { .. }), "got {:?}", err);
    }

    #[test]
    fn test_malformed_json_falls_back_to_raw_text() {
        match parse_text_block("{\"ckpt_name\": \"x\", broken") {
            RawMetadata::RawText(text) => assert!(text.contains("ckpt_name")),
            other => panic!("expected raw text, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_tokens_are_tolerated() {
        match parse_text_block(r#"{"cfg": NaN, "steps": 20}"#) {
            RawMetadata::Structured(map) => {
                assert!(map["cfg"].is_null());
                assert_eq!(map["steps"], 20);
            }
            other => panic!("expected structured metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_preferred_keyword_wins() {
        let chunks = vec![
            ("workflow".to_string(), r#"{"nodes": []}"#.to_string()),
            ("parameters".to_string(), "a cat\nSteps: 20".to_string()),
        ];
        match interpret_chunks(&chunks) {
            RawMetadata::Structured(map) => assert_eq!(map["Steps"], "20"),
            other => panic!("expected structured metadata, got {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_chunks_join_as_raw_text() {
        let chunks = vec![("Comment".to_string(), "made with love".to_string())];
        assert_eq!(
            interpret_chunks(&chunks),
            RawMetadata::RawText("Comment: made with love".to_string())
        );
    }

    #[test]
    fn test_decode_user_comment() {
        let mut ascii = b"ASCII\0\0\0".to_vec();
        ascii.extend_from_slice(b"Steps: 20");
        assert_eq!(decode_user_comment(&ascii).as_deref(), Some("Steps: 20"));

        let mut unicode = b"UNICODE\0".to_vec();
        for unit in "hi".encode_utf16() {
            unicode.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_user_comment(&unicode).as_deref(), Some("hi"));
    }
}

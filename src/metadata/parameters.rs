// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Parser for A1111-style "parameters" text
//!
//! ```text
//! masterpiece, pony <lora:styleA:0.8>
//! Negative prompt: blurry
//! Steps: 30, Sampler: Euler a, CFG scale: 7, Seed: 42, Size: 832x1216, Model: ponyV6
//! ```
//!
//! The result is a flat JSON map with the original setting keys, which the
//! normalizer then maps onto canonical fields.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

const NEGATIVE_PREFIX: &str = "Negative prompt:";

/// `key: value` pairs of the settings line; quoted values may contain commas
fn param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\s*(\w[\w \-/]*):\s*("(?:\\.|[^\\"])*"|[^,]*)(?:,|$)"#)
            .expect("valid parameter regex")
    })
}

fn lora_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<lora:([^:>]+)(?::([^:>]+))?[^>]*>").expect("valid lora tag regex")
    })
}

fn size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s*x\s*(\d+)").expect("valid size regex"))
}

/// Parse parameter text; `None` when the text is not in this format
pub fn parse(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let lines: Vec<&str> = text.lines().collect();
    let settings_idx = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with("Steps:"));
    let negative_idx = lines
        .iter()
        .position(|line| line.trim_start().starts_with(NEGATIVE_PREFIX));

    if settings_idx.is_none() && negative_idx.is_none() {
        return None;
    }

    let prompt_end = negative_idx.or(settings_idx).unwrap_or(lines.len());
    let prompt = lines[..prompt_end].join("\n").trim().to_string();

    let negative = negative_idx.map(|start| {
        let end = settings_idx.filter(|&s| s > start).unwrap_or(lines.len());
        let joined = lines[start..end].join("\n");
        joined
            .trim_start()
            .trim_start_matches(NEGATIVE_PREFIX)
            .trim()
            .to_string()
    });

    let mut map = Map::new();
    if !prompt.is_empty() {
        map.insert("prompt".to_string(), Value::String(prompt.clone()));
    }
    if let Some(negative) = negative.filter(|n| !n.is_empty()) {
        map.insert("negative_prompt".to_string(), Value::String(negative));
    }

    if let Some(idx) = settings_idx {
        for line in &lines[idx..] {
            parse_settings_line(line, &mut map);
        }
    }

    let loras = collect_loras(&prompt, &map);
    if !loras.is_empty() {
        map.insert("loras".to_string(), Value::Array(loras));
    }

    Some(map)
}

fn parse_settings_line(line: &str, map: &mut Map<String, Value>) {
    for caps in param_regex().captures_iter(line) {
        let key = caps[1].trim().to_string();
        let raw = caps[2].trim();
        let value = unquote(raw);

        if key.eq_ignore_ascii_case("size") {
            if let Some(size) = size_regex().captures(&value) {
                map.entry("width").or_insert_with(|| Value::String(size[1].to_string()));
                map.entry("height").or_insert_with(|| Value::String(size[2].to_string()));
            }
        }
        // Repeated keys keep their first value; the normalizer reports
        // case-variant duplicates on its own.
        map.entry(key).or_insert(Value::String(value));
    }
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        raw.to_string()
    }
}

/// Inline `<lora:name:weight>` tags first, then names only listed in "Lora hashes"
fn collect_loras(prompt: &str, map: &Map<String, Value>) -> Vec<Value> {
    let mut loras = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for caps in lora_tag_regex().captures_iter(prompt) {
        let name = caps[1].trim().to_string();
        let strength = caps.get(2).and_then(|m| m.as_str().trim().parse::<f64>().ok());
        if seen.iter().any(|s| s.eq_ignore_ascii_case(&name)) {
            continue;
        }
        seen.push(name.clone());
        loras.push(match strength {
            Some(s) => json!({ "name": name, "strength": s }),
            None => json!({ "name": name }),
        });
    }

    let hashes = map
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Lora hashes"))
        .and_then(|(_, v)| v.as_str());
    if let Some(hashes) = hashes {
        for entry in hashes.split(',') {
            let name = entry.split(':').next().unwrap_or("").trim();
            if name.is_empty() || seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                continue;
            }
            seen.push(name.to_string());
            loras.push(json!({ "name": name }));
        }
    }

    loras
}

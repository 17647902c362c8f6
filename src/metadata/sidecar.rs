// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Human-readable `.txt` report written next to sorted images

use std::fmt::Write as _;

use super::MetadataRecord;

const SEPARATOR: &str = "==================================================";

/// Settings shown in the sampling section, in display order
const SAMPLING_SETTINGS: &[(&str, &str)] = &[
    ("steps", "Steps"),
    ("cfg", "CFG Scale"),
    ("sampler", "Sampler"),
    ("scheduler", "Scheduler"),
    ("denoise", "Denoise"),
    ("seed", "Seed"),
    ("clip_skip", "Clip Skip"),
];

/// Render the report for one image
pub fn format(record: &MetadataRecord, file_name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== METADATA REPORT ===");
    let _ = writeln!(out, "File: {}", file_name);
    let _ = writeln!(out, "{}", SEPARATOR);

    section(&mut out, "MODELS", models_lines(record));
    section(&mut out, "LORAS", lora_lines(record));
    section(
        &mut out,
        "POSITIVE PROMPT",
        vec![record.prompt.clone().unwrap_or_else(|| "No positive prompt found".to_string())],
    );
    section(
        &mut out,
        "NEGATIVE PROMPT",
        vec![record
            .negative_prompt
            .clone()
            .unwrap_or_else(|| "No negative prompt found".to_string())],
    );
    section(&mut out, "SAMPLING PARAMETERS", sampling_lines(record));

    if let (Some(w), Some(h)) = (record.setting("width"), record.setting("height")) {
        section(&mut out, "IMAGE PARAMETERS", vec![format!("Size: {}x{}", w, h)]);
    }

    let other: Vec<String> = record
        .settings
        .iter()
        .filter(|(name, _)| {
            !SAMPLING_SETTINGS.iter().any(|(key, _)| *key == name.as_str())
                && name.as_str() != "width"
                && name.as_str() != "height"
        })
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect();
    if !other.is_empty() {
        section(&mut out, "ADVANCED SETTINGS", other);
    }

    if let Some(raw) = &record.raw_text {
        section(&mut out, "RAW METADATA", vec![raw.clone()]);
    }
    out
}

fn section(out: &mut String, title: &str, lines: Vec<String>) {
    let _ = writeln!(out, "\n=== {} ===", title);
    for line in lines {
        let _ = writeln!(out, "{}", line);
    }
}

fn models_lines(record: &MetadataRecord) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(checkpoint) = &record.checkpoint {
        lines.push(format!("Checkpoint: {}", checkpoint));
    }
    if let Some(base) = &record.base_model {
        lines.push(format!("Base Model: {}", base.name));
        lines.push(format!("Family: {}", base.family.as_deref().unwrap_or("Other")));
    }
    if lines.is_empty() {
        lines.push("No checkpoint found".to_string());
    }
    lines
}

fn lora_lines(record: &MetadataRecord) -> Vec<String> {
    if record.loras.is_empty() {
        return vec!["No LoRAs used".to_string()];
    }
    record
        .loras
        .iter()
        .enumerate()
        .map(|(i, lora)| match lora.strength {
            Some(s) if s != 1.0 => format!("LoRA {}: {} (strength {})", i + 1, lora.original, s),
            _ => format!("LoRA {}: {}", i + 1, lora.original),
        })
        .collect()
}

fn sampling_lines(record: &MetadataRecord) -> Vec<String> {
    let lines: Vec<String> = SAMPLING_SETTINGS
        .iter()
        .filter_map(|(key, label)| record.setting(key).map(|v| format!("{}: {}", label, v)))
        .collect();
    if lines.is_empty() {
        vec!["No sampling parameters found".to_string()]
    } else {
        lines
    }
}

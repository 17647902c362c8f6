// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use libfuzzer_sys::fuzz_target;
use sorter::config::ModelConfig;
use sorter::metadata::{parse_text_block, Normalizer};

// Embedded text blocks come from untrusted files: parsing and normalizing
// must never panic, whatever the bytes.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let raw = parse_text_block(text);
    let model = ModelConfig::default();
    let _ = Normalizer::new(&model).normalize(&raw);
});

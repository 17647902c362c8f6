// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Attribute normalization
//!
//! Turns [`RawMetadata`] into a [`MetadataRecord`]. Three structured shapes
//! are understood:
//!
//! - ComfyUI API graphs (`{"<id>": {"class_type": .., "inputs": {..}}}`)
//! - ComfyUI UI workflows (`{"nodes": [{"type": .., "widgets_values": [..]}]}`)
//! - Flat key/value maps (A1111 parameters, hand-written JSON)
//!
//! Anything else ends up as raw text.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use super::{BaseModel, LoraRef, MetadataRecord, RawMetadata, SettingValue};
use crate::config::{ModelConfig, ModelFamily};

/// Reference chains deeper than this are treated as unresolvable
const MAX_REFERENCE_DEPTH: usize = 8;

/// Settings parsed as numbers when possible
const NUMERIC_SETTINGS: &[&str] = &["steps", "cfg", "seed", "denoise", "width", "height", "clip_skip"];

/// Two raw keys mapped onto the same canonical field; the first one was kept
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NormalizationWarning {
    pub field: String,
    pub kept_key: String,
    pub ignored_key: String,
}

impl std::fmt::Display for NormalizationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field '{}' set by both '{}' and '{}'; kept '{}'",
            self.field, self.kept_key, self.ignored_key, self.kept_key
        )
    }
}

/// Output of one normalization pass
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    /// `None` when the image carried no metadata at all
    pub record: Option<MetadataRecord>,
    pub warnings: Vec<NormalizationWarning>,
}

/// Canonical destination of a raw key
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Model,
    Loras,
    Prompt,
    Negative,
    Setting(&'static str),
}

impl Field {
    fn name(&self) -> &'static str {
        match self {
            Field::Model => "model",
            Field::Loras => "loras",
            Field::Prompt => "prompt",
            Field::Negative => "negative_prompt",
            Field::Setting(name) => name,
        }
    }
}

/// Lowercase alphanumerics only: `CFG scale`, `cfg_scale` and `cfgScale` agree
fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn field_for(key: &str) -> Option<Field> {
    let field = match canonical_key(key).as_str() {
        "ckptname" | "checkpoint" | "checkpointname" | "model" | "modelname" | "basemodel"
        | "baseckpt" | "sdmodel" | "sdmodelname" => Field::Model,
        "loras" | "lora" | "loraname" | "loranames" | "lorahashes" => Field::Loras,
        "prompt" | "positive" | "positiveprompt" => Field::Prompt,
        "negative" | "negativeprompt" => Field::Negative,
        "steps" => Field::Setting("steps"),
        "cfg" | "cfgscale" | "guidance" | "guidancescale" => Field::Setting("cfg"),
        "seed" | "noiseseed" => Field::Setting("seed"),
        "sampler" | "samplername" => Field::Setting("sampler"),
        "scheduler" | "scheduletype" => Field::Setting("scheduler"),
        "denoise" | "denoisingstrength" => Field::Setting("denoise"),
        "width" => Field::Setting("width"),
        "height" => Field::Setting("height"),
        "clipskip" => Field::Setting("clip_skip"),
        _ => return None,
    };
    Some(field)
}

fn is_numeric_setting(name: &str) -> bool {
    NUMERIC_SETTINGS.contains(&name)
}

/// Maps raw metadata onto canonical attributes
pub struct Normalizer<'a> {
    families: &'a [ModelFamily],
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a ModelConfig) -> Self {
        Self {
            families: &config.families,
        }
    }

    pub fn normalize(&self, raw: &RawMetadata) -> Normalized {
        match raw {
            RawMetadata::Absent => Normalized::default(),
            RawMetadata::RawText(text) => Normalized {
                record: Some(MetadataRecord {
                    raw_text: Some(text.clone()),
                    ..MetadataRecord::default()
                }),
                warnings: Vec::new(),
            },
            RawMetadata::Structured(map) => {
                let mut builder = RecordBuilder::default();
                if is_api_graph(map) {
                    builder.absorb_api_graph(map);
                } else if let Some(nodes) = ui_workflow_nodes(map) {
                    builder.absorb_ui_workflow(nodes);
                } else {
                    builder.absorb_flat(map);
                }
                let (mut record, warnings) = builder.finish();
                record.base_model = record
                    .checkpoint
                    .as_deref()
                    .map(|ckpt| self.detect_base_model(ckpt));
                Normalized {
                    record: Some(record),
                    warnings,
                }
            }
        }
    }

    /// Match family fragments against the raw checkpoint, case-insensitively
    pub fn detect_base_model(&self, checkpoint: &str) -> BaseModel {
        let lowered = checkpoint.to_lowercase();
        let family = self
            .families
            .iter()
            .find(|f| f.patterns.iter().any(|p| lowered.contains(&p.to_lowercase())))
            .map(|f| f.name.clone());
        BaseModel {
            family,
            name: clean_checkpoint_name(checkpoint),
        }
    }
}

/// Checkpoint file stem without directories (either separator style)
pub fn clean_checkpoint_name(checkpoint: &str) -> String {
    let last = checkpoint
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(checkpoint)
        .trim();
    let stem = Path::new(last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| last.to_string());
    if stem.is_empty() {
        last.to_string()
    } else {
        stem
    }
}

fn weight_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\s*(-?\d+(?:\.\d+)?)\s*$").expect("valid weight regex"))
}

fn extension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.(safetensors|ckpt|pt|pth|bin)$").expect("valid extension regex"))
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[-_. ]v\d+(?:\.\d+)*$").expect("valid version regex"))
}

/// Build a LoRA reference from its raw string
///
/// The key drops directories, a `:weight` suffix, the file extension and a
/// trailing version tag; the original string is kept for display.
pub fn lora_ref(raw: &str, strength: Option<f64>) -> LoraRef {
    let original = raw.trim().to_string();
    let base = original.rsplit(['/', '\\']).next().unwrap_or(&original);

    let mut strength = strength;
    let mut key = base.to_string();
    if let Some(caps) = weight_suffix_regex().captures(&key) {
        if strength.is_none() {
            strength = caps[1].parse::<f64>().ok();
        }
        key = key[..caps.get(0).map(|m| m.start()).unwrap_or(key.len())].to_string();
    }
    key = extension_regex().replace(&key, "").into_owned();
    let without_version = version_regex().replace(&key, "").into_owned();
    if !without_version.trim().is_empty() {
        key = without_version;
    }
    let key = key.trim_matches(|c: char| c == '_' || c == '-' || c == ' ' || c == '.').to_string();

    LoraRef {
        key: if key.is_empty() { base.to_string() } else { key },
        original,
        strength,
    }
}

/// Accumulates fields with first-seen-wins semantics
#[derive(Default)]
struct RecordBuilder {
    record: MetadataRecord,
    /// canonical field name -> raw key that set it
    sources: BTreeMap<String, String>,
    warnings: Vec<NormalizationWarning>,
}

impl RecordBuilder {
    /// Claim a canonical field for `raw_key`; false when an earlier key owns it
    fn claim(&mut self, field: &str, raw_key: &str) -> bool {
        self.claim_slot(field, field, raw_key)
    }

    /// Like [`claim`](Self::claim), with a slot finer than the reported field
    fn claim_slot(&mut self, slot: &str, field: &str, raw_key: &str) -> bool {
        match self.sources.get(slot) {
            Some(kept) if kept != raw_key => {
                self.warnings.push(NormalizationWarning {
                    field: field.to_string(),
                    kept_key: kept.clone(),
                    ignored_key: raw_key.to_string(),
                });
                false
            }
            Some(_) => false,
            None => {
                self.sources.insert(slot.to_string(), raw_key.to_string());
                true
            }
        }
    }

    fn push_lora(&mut self, lora: LoraRef) {
        if !self.record.loras.iter().any(|l| l.key.eq_ignore_ascii_case(&lora.key)) {
            self.record.loras.push(lora);
        }
    }

    fn set_setting(&mut self, name: &str, value: &Value) {
        if self.record.settings.contains_key(name) {
            return;
        }
        if let Some(v) = SettingValue::from_json(value, is_numeric_setting(name)) {
            self.record.settings.insert(name.to_string(), v);
        }
    }

    fn finish(self) -> (MetadataRecord, Vec<NormalizationWarning>) {
        (self.record, self.warnings)
    }

    // === Flat maps ===

    fn absorb_flat(&mut self, map: &Map<String, Value>) {
        for (key, value) in map {
            match field_for(key) {
                // Distinct LoRA keys merge: "loras" and "Lora hashes" list the
                // same stack in different forms. Case variants of one key conflict.
                Some(Field::Loras) => {
                    let slot = format!("{}/{}", Field::Loras.name(), canonical_key(key));
                    if self.claim_slot(&slot, Field::Loras.name(), key) {
                        self.absorb_lora_value(value);
                    }
                }
                Some(field) => {
                    let name = field.name();
                    if value.is_null() || !self.claim(name, key) {
                        continue;
                    }
                    match field {
                        Field::Model => self.record.checkpoint = value_text(value),
                        Field::Prompt => {
                            if let Some(graph) = value.as_object().filter(|m| is_api_graph(m)) {
                                self.absorb_api_graph(graph);
                            } else {
                                self.record.prompt = value_text(value);
                            }
                        }
                        Field::Negative => self.record.negative_prompt = value_text(value),
                        Field::Setting(setting) => self.set_setting(setting, value),
                        Field::Loras => {}
                    }
                }
                None => {
                    // Unknown scalar keys stay searchable under their own name
                    let canonical = canonical_key(key);
                    if canonical.is_empty() || !is_scalar(value) || !self.claim(&canonical, key) {
                        continue;
                    }
                    self.set_setting(key, value);
                }
            }
        }
    }

    fn absorb_lora_value(&mut self, value: &Value) {
        match value {
            Value::String(s) if s.contains(',') => {
                // "Lora hashes" style: "name: hash, name: hash"
                for entry in s.split(',') {
                    let name = entry.split(':').next().unwrap_or("").trim();
                    if !name.is_empty() {
                        self.push_lora(lora_ref(name, None));
                    }
                }
            }
            Value::String(s) if !s.trim().is_empty() => self.push_lora(lora_ref(s, None)),
            Value::Array(items) => {
                for item in items {
                    self.absorb_lora_value(item);
                }
            }
            Value::Object(obj) => {
                let name = ["name", "lora_name", "lora"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(|v| v.as_str()));
                if let Some(name) = name {
                    let strength = ["strength", "weight", "strength_model"]
                        .iter()
                        .find_map(|k| obj.get(*k).and_then(|v| v.as_f64()));
                    self.push_lora(lora_ref(name, strength));
                }
            }
            _ => {}
        }
    }

    // === ComfyUI API graphs ===

    fn absorb_api_graph(&mut self, graph: &Map<String, Value>) {
        let nodes: Vec<GraphNode> = graph
            .iter()
            .filter_map(|(_, v)| GraphNode::from_value(v))
            .collect();

        let mut base_ckpt: Option<String> = None;
        let mut explicit_base: Option<String> = None;
        let mut refiner_ckpt: Option<String> = None;

        for node in &nodes {
            if let Some(base) = node.input_str("base_ckpt") {
                explicit_base.get_or_insert_with(|| base.to_string());
            }
            if let Some(ckpt) = node.input_str("ckpt_name") {
                if node.is_refiner() {
                    refiner_ckpt.get_or_insert_with(|| ckpt.to_string());
                } else {
                    base_ckpt.get_or_insert_with(|| ckpt.to_string());
                }
            }
            for field in ["refiner_ckpt", "refiner_model"] {
                if let Some(ckpt) = node.input_str(field) {
                    refiner_ckpt.get_or_insert_with(|| ckpt.to_string());
                }
            }
        }
        if self.record.checkpoint.is_none() {
            self.record.checkpoint = explicit_base.or(base_ckpt).or(refiner_ckpt);
            if self.record.checkpoint.is_some() {
                self.sources.entry("model".to_string()).or_insert_with(|| "ckpt_name".to_string());
            }
        }

        for node in &nodes {
            if let Some(name) = node.input_str("lora_name") {
                let strength = node.inputs.get("strength_model").and_then(|v| v.as_f64());
                self.push_lora(lora_ref(name, strength));
            }
            // Stacker nodes: {"lora_1": {"on": true, "lora": "x", "strength": 1}}
            for value in node.inputs.values() {
                if let Some(obj) = value.as_object() {
                    let enabled = obj.get("on").and_then(|v| v.as_bool()).unwrap_or(true);
                    if let (true, Some(name)) = (enabled, obj.get("lora").and_then(|v| v.as_str())) {
                        if !name.is_empty() && name != "None" {
                            let strength = obj.get("strength").and_then(|v| v.as_f64());
                            self.push_lora(lora_ref(name, strength));
                        }
                    }
                }
            }
        }

        let sampler = nodes
            .iter()
            .filter(|n| n.is_sampler())
            .find(|n| !n.is_refiner())
            .or_else(|| nodes.iter().find(|n| n.is_sampler()));

        if let Some(sampler) = sampler {
            for (input, setting) in [
                ("steps", "steps"),
                ("cfg", "cfg"),
                ("sampler_name", "sampler"),
                ("scheduler", "scheduler"),
                ("denoise", "denoise"),
                ("seed", "seed"),
                ("noise_seed", "seed"),
            ] {
                if let Some(value) = sampler.inputs.get(input) {
                    self.set_setting(setting, value);
                }
            }
            if self.record.prompt.is_none() {
                self.record.prompt = sampler
                    .input_ref("positive")
                    .and_then(|id| resolve_text(graph, id, 0));
            }
            if self.record.negative_prompt.is_none() {
                self.record.negative_prompt = sampler
                    .input_ref("negative")
                    .and_then(|id| resolve_text(graph, id, 0));
            }
        }

        // Title heuristics when the sampler wiring did not resolve
        for node in nodes.iter().filter(|n| n.class_type.starts_with("CLIPTextEncode")) {
            let Some(text) = encoder_text(graph, node) else {
                continue;
            };
            if node.title_contains("neg") {
                self.record.negative_prompt.get_or_insert(text);
            } else if !node.is_refiner() || self.record.prompt.is_none() {
                self.record.prompt.get_or_insert(text);
            }
        }

        for node in &nodes {
            if node.class_type.contains("EmptyLatent") || node.class_type.contains("LatentSize") {
                if let Some(resolution) = node.input_str("resolution") {
                    if let Some((w, h)) = parse_resolution(resolution) {
                        self.set_setting("width", &Value::from(w));
                        self.set_setting("height", &Value::from(h));
                    }
                }
                for dim in ["width", "height"] {
                    if let Some(v) = node.inputs.get(dim) {
                        self.set_setting(dim, v);
                    }
                }
            }
        }
    }

    // === ComfyUI UI workflows ===

    fn absorb_ui_workflow(&mut self, nodes: &[Value]) {
        for node in nodes {
            let node_type = node.get("type").and_then(|v| v.as_str()).unwrap_or("");
            let title = node.get("title").and_then(|v| v.as_str()).unwrap_or("").to_lowercase();
            let Some(widgets) = node.get("widgets_values").and_then(|v| v.as_array()) else {
                continue;
            };
            let widget_str = |i: usize| widgets.get(i).and_then(|v| v.as_str());

            if node_type.contains("CheckpointLoader") {
                if self.record.checkpoint.is_none() {
                    if let Some(ckpt) = widget_str(0) {
                        self.record.checkpoint = Some(ckpt.to_string());
                        self.sources.insert("model".to_string(), "ckpt_name".to_string());
                    }
                }
            } else if node_type.contains("LoraLoader") {
                if let Some(name) = widget_str(0) {
                    let strength = widgets.get(1).and_then(|v| v.as_f64());
                    self.push_lora(lora_ref(name, strength));
                }
            } else if node_type.starts_with("CLIPTextEncode") {
                if let Some(text) = widget_str(0).map(str::trim).filter(|t| !t.is_empty()) {
                    if title.contains("neg") {
                        self.record.negative_prompt.get_or_insert_with(|| text.to_string());
                    } else if self.record.prompt.is_none() {
                        self.record.prompt = Some(text.to_string());
                    } else {
                        self.record.negative_prompt.get_or_insert_with(|| text.to_string());
                    }
                }
            } else if node_type == "KSampler" {
                // [seed, seed control, steps, cfg, sampler, scheduler, denoise]
                for (idx, setting) in [(0, "seed"), (2, "steps"), (3, "cfg"), (4, "sampler"), (5, "scheduler"), (6, "denoise")] {
                    if let Some(v) = widgets.get(idx) {
                        self.set_setting(setting, v);
                    }
                }
            }
        }
    }
}

/// One node of an API graph
struct GraphNode<'g> {
    class_type: &'g str,
    title: String,
    inputs: &'g Map<String, Value>,
}

impl<'g> GraphNode<'g> {
    fn from_value(value: &'g Value) -> Option<Self> {
        let obj = value.as_object()?;
        let class_type = obj.get("class_type")?.as_str()?;
        static EMPTY: OnceLock<Map<String, Value>> = OnceLock::new();
        let inputs = obj
            .get("inputs")
            .and_then(|v| v.as_object())
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new));
        let title = obj
            .get("_meta")
            .and_then(|m| m.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_lowercase();
        Some(Self {
            class_type,
            title,
            inputs,
        })
    }

    fn input_str(&self, key: &str) -> Option<&'g str> {
        self.inputs.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    /// `["<node id>", slot]` link to another node
    fn input_ref(&self, key: &str) -> Option<&'g str> {
        self.inputs.get(key).and_then(link_target)
    }

    fn title_contains(&self, needle: &str) -> bool {
        self.title.contains(needle)
    }

    fn is_sampler(&self) -> bool {
        self.class_type.to_lowercase().contains("sampler")
            && (self.inputs.contains_key("steps") || self.inputs.contains_key("cfg"))
    }

    fn is_refiner(&self) -> bool {
        self.class_type.to_lowercase().contains("refiner")
            || self.title.contains("refiner")
            || self.inputs.contains_key("ascore")
            || self
                .inputs
                .get("start_at_step")
                .and_then(|v| v.as_f64())
                .map(|s| s > 0.0)
                .unwrap_or(false)
    }
}

fn link_target(value: &Value) -> Option<&str> {
    let arr = value.as_array()?;
    if arr.len() != 2 || !arr[1].is_number() {
        return None;
    }
    match &arr[0] {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

fn encoder_text(graph: &Map<String, Value>, node: &GraphNode<'_>) -> Option<String> {
    for key in ["text", "text_g"] {
        match node.inputs.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(v) => {
                if let Some(text) = link_target(v).and_then(|id| resolve_text(graph, id, 0)) {
                    return Some(text);
                }
            }
            None => {}
        }
    }
    None
}

/// Follow a link to the node that actually holds prompt text
fn resolve_text(graph: &Map<String, Value>, node_id: &str, depth: usize) -> Option<String> {
    if depth > MAX_REFERENCE_DEPTH {
        return None;
    }
    let node = GraphNode::from_value(graph.get(node_id)?)?;

    if node.class_type.contains("String Literal") || node.class_type.contains("PrimitiveString") {
        if let Some(s) = node.input_str("string").or_else(|| node.input_str("value")) {
            return Some(s.trim().to_string());
        }
    }
    if node.class_type.contains("ShowText") {
        if let Some(s) = node.input_str("text_0") {
            return Some(s.trim().to_string());
        }
    }
    for key in ["text", "text_g", "string", "value"] {
        match node.inputs.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(v) => {
                if let Some(next) = link_target(v) {
                    if let Some(text) = resolve_text(graph, next, depth + 1) {
                        return Some(text);
                    }
                }
            }
            None => {}
        }
    }
    None
}

fn is_api_graph(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map.values().any(|v| {
            v.get("class_type").map(|c| c.is_string()).unwrap_or(false) && v.get("inputs").is_some()
        })
}

fn ui_workflow_nodes(map: &Map<String, Value>) -> Option<&[Value]> {
    let nodes = map.get("nodes")?.as_array()?;
    nodes
        .iter()
        .any(|n| n.get("type").is_some())
        .then_some(nodes.as_slice())
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// "896x1152 (0.78)" -> (896, 1152)
fn parse_resolution(text: &str) -> Option<(u64, u64)> {
    let size = text.split_whitespace().next()?;
    let (w, h) = size.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

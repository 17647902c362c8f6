// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Query matching against normalized metadata
//!
//! ANY and ALL test each term as a substring of some searchable value. EXACT
//! compares the whole term set with the whole value set of a single field,
//! ignoring order. Settings terms written as `name=value` compare numerically
//! when both sides are numbers. In regex mode a term is a pattern: it must
//! find a match for ANY and ALL, and match the whole value for EXACT.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::metadata::MetadataRecord;
use crate::{Result, SorterError};

/// Tolerance for numeric setting comparisons
const NUMERIC_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Some term matches some field
    #[default]
    Any,
    /// Every term matches some field
    All,
    /// The term set equals one field's value set
    Exact,
}

/// Which part of the record a query looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryField {
    #[default]
    All,
    Model,
    Lora,
    Prompt,
    Negative,
    Settings,
}

impl QueryField {
    fn fields(&self) -> &'static [QueryField] {
        match self {
            QueryField::All => &[
                QueryField::Model,
                QueryField::Lora,
                QueryField::Prompt,
                QueryField::Negative,
                QueryField::Settings,
            ],
            QueryField::Model => &[QueryField::Model],
            QueryField::Lora => &[QueryField::Lora],
            QueryField::Prompt => &[QueryField::Prompt],
            QueryField::Negative => &[QueryField::Negative],
            QueryField::Settings => &[QueryField::Settings],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub terms: Vec<String>,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub field: QueryField,
    /// Treat terms as regular expressions
    #[serde(default)]
    pub regex: bool,
}

impl QuerySpec {
    /// Build a query; blank terms are dropped
    pub fn new<I, S>(terms: I, mode: MatchMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms
                .into_iter()
                .map(Into::into)
                .map(|t: String| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            mode,
            case_sensitive: false,
            field: QueryField::All,
            regex: false,
        }
    }

    pub fn with_regex(mut self, regex: bool) -> Self {
        self.regex = regex;
        self
    }

    pub fn with_field(mut self, field: QueryField) -> Self {
        self.field = field;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.iter().all(|t| t.trim().is_empty())
    }

    /// Reject terms that do not compile in regex mode
    pub fn validate(&self) -> Result<()> {
        if !self.regex {
            return Ok(());
        }
        for term in self.terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            self.compile(term, false)
                .map_err(|e| SorterError::Config(format!("invalid search pattern '{}': {}", term, e)))?;
        }
        Ok(())
    }

    fn compile(&self, term: &str, whole: bool) -> std::result::Result<Regex, regex::Error> {
        let pattern = if whole {
            format!("^(?:{})$", term)
        } else {
            term.to_string()
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(!self.case_sensitive)
            .build()
    }

    fn fold(&self, text: &str) -> String {
        if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }
}

/// One searchable value of a record
struct FieldValue<'a> {
    /// Setting name, for `name=value` terms
    setting: Option<&'a str>,
    text: String,
    number: Option<f64>,
}

impl<'a> FieldValue<'a> {
    fn text(text: &str) -> Self {
        Self {
            setting: None,
            text: text.to_string(),
            number: None,
        }
    }
}

/// Value sets of one field; EXACT compares against each set on its own
fn value_sets<'a>(record: &'a MetadataRecord, field: QueryField) -> Vec<Vec<FieldValue<'a>>> {
    match field {
        QueryField::Model => {
            let mut sets = Vec::new();
            if let Some(checkpoint) = &record.checkpoint {
                sets.push(vec![FieldValue::text(checkpoint)]);
            }
            if let Some(base) = &record.base_model {
                sets.push(vec![FieldValue::text(&base.name)]);
                if let Some(family) = &base.family {
                    sets.push(vec![FieldValue::text(family)]);
                }
            }
            sets
        }
        QueryField::Lora if record.loras.is_empty() => Vec::new(),
        QueryField::Lora => vec![
            record.loras.iter().map(|l| FieldValue::text(&l.key)).collect(),
            record.loras.iter().map(|l| FieldValue::text(&l.original)).collect(),
        ],
        QueryField::Prompt => record
            .prompt
            .iter()
            .map(|p| vec![FieldValue::text(p)])
            .collect(),
        QueryField::Negative => record
            .negative_prompt
            .iter()
            .map(|p| vec![FieldValue::text(p)])
            .collect(),
        QueryField::Settings => record
            .settings
            .iter()
            .map(|(name, value)| {
                vec![FieldValue {
                    setting: Some(name.as_str()),
                    text: value.to_string(),
                    number: value.as_f64(),
                }]
            })
            .collect(),
        QueryField::All => QueryField::All
            .fields()
            .iter()
            .flat_map(|f| value_sets(record, *f))
            .chain(record.raw_text.iter().map(|t| vec![FieldValue::text(t)]))
            .collect(),
    }
}

/// Split `name=value`, both sides non-empty
fn setting_term(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let (name, value) = (name.trim(), value.trim());
    (!name.is_empty() && !value.is_empty()).then_some((name, value))
}

/// A query term prepared for matching
struct Term<'s> {
    text: &'s str,
    /// Compiled pattern in regex mode; the EXACT form is anchored
    pattern: Option<Regex>,
}

impl<'s> Term<'s> {
    fn new(spec: &QuerySpec, text: &'s str, whole: bool) -> Self {
        let pattern = spec.regex.then(|| {
            spec.compile(text, whole)
                .or_else(|_| spec.compile(&regex::escape(text), whole))
        });
        Self {
            text,
            pattern: pattern.and_then(|p| p.ok()),
        }
    }
}

fn prepare<'s>(spec: &'s QuerySpec, whole: bool) -> Vec<Term<'s>> {
    spec.terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| Term::new(spec, t, whole))
        .collect()
}

fn term_matches_value(spec: &QuerySpec, term: &Term<'_>, value: &FieldValue<'_>, whole: bool) -> bool {
    if let (Some((name, expected)), Some(setting)) = (setting_term(term.text), value.setting) {
        if name.eq_ignore_ascii_case(setting) {
            if let (Ok(expected), Some(actual)) = (expected.parse::<f64>(), value.number) {
                return (expected - actual).abs() < NUMERIC_EPSILON;
            }
            return spec.fold(expected) == spec.fold(&value.text);
        }
    }

    if let Some(pattern) = &term.pattern {
        return pattern.is_match(&value.text);
    }
    let needle = spec.fold(term.text);
    let text = spec.fold(&value.text);
    if whole {
        text == needle
    } else {
        text.contains(&needle)
    }
}

fn term_matches_record(spec: &QuerySpec, record: &MetadataRecord, term: &Term<'_>) -> bool {
    value_sets(record, spec.field)
        .iter()
        .flatten()
        .any(|value| term_matches_value(spec, term, value, false))
}

/// Term set equals the value set, ignoring order and duplicates
fn set_equals(spec: &QuerySpec, terms: &[Term<'_>], values: &[FieldValue<'_>]) -> bool {
    if values.is_empty() {
        return false;
    }
    let every_term = terms
        .iter()
        .all(|t| values.iter().any(|v| term_matches_value(spec, t, v, true)));
    let every_value = values
        .iter()
        .all(|v| terms.iter().any(|t| term_matches_value(spec, t, v, true)));
    every_term && every_value
}

/// Whether a record satisfies the query; an empty query matches nothing
pub fn matches(record: &MetadataRecord, spec: &QuerySpec) -> bool {
    let terms = prepare(spec, spec.mode == MatchMode::Exact);
    if terms.is_empty() {
        return false;
    }

    match spec.mode {
        MatchMode::Any => terms.iter().any(|t| term_matches_record(spec, record, t)),
        MatchMode::All => terms.iter().all(|t| term_matches_record(spec, record, t)),
        MatchMode::Exact => value_sets(record, spec.field)
            .iter()
            .any(|set| set_equals(spec, &terms, set)),
    }
}

/// First query term the record matched, for per-term placement
pub fn first_matching_term<'s>(record: &MetadataRecord, spec: &'s QuerySpec) -> Option<&'s str> {
    if !matches(record, spec) {
        return None;
    }
    let terms = prepare(spec, false);
    match spec.mode {
        MatchMode::Any => terms
            .into_iter()
            .find(|t| term_matches_record(spec, record, t))
            .map(|t| t.text),
        MatchMode::All | MatchMode::Exact => terms.first().map(|t| t.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BaseModel, LoraRef, SettingValue};

    fn lora(key: &str) -> LoraRef {
        LoraRef {
            key: key.to_string(),
            original: format!("{}.safetensors", key),
            strength: None,
        }
    }

    fn record() -> MetadataRecord {
        let mut record = MetadataRecord {
            checkpoint: Some("ponyDiffusionV6XL.safetensors".to_string()),
            base_model: Some(BaseModel {
                family: Some("Pony".to_string()),
                name: "ponyDiffusionV6XL".to_string(),
            }),
            loras: vec![lora("styleB"), lora("styleA")],
            prompt: Some("anime style pony art".to_string()),
            negative_prompt: Some("blurry".to_string()),
            ..MetadataRecord::default()
        };
        record.settings.insert("steps".to_string(), SettingValue::parse_numeric("30"));
        record.settings.insert("cfg".to_string(), SettingValue::parse_numeric("7.0"));
        record
            .settings
            .insert("sampler".to_string(), SettingValue::Text("Euler a".to_string()));
        record
    }

    #[test]
    fn test_exact_lora_set_is_order_independent() {
        let mut rec = record();
        let spec = QuerySpec::new(["styleA", "styleB"], MatchMode::Exact).with_field(QueryField::Lora);
        assert!(matches(&rec, &spec));

        rec.loras = vec![lora("styleA")];
        assert!(!matches(&rec, &spec));

        // Any-field EXACT behaves the same for set-valued fields
        let spec = QuerySpec::new(["styleA", "styleB"], MatchMode::Exact);
        assert!(!matches(&rec, &spec));
        rec.loras = vec![lora("styleB"), lora("styleA")];
        assert!(matches(&rec, &spec));
    }

    #[test]
    fn test_exact_is_not_substring() {
        let rec = record();
        let spec = QuerySpec::new(["anime"], MatchMode::Exact).with_field(QueryField::Prompt);
        assert!(!matches(&rec, &spec));

        let spec = QuerySpec::new(["Anime Style Pony Art"], MatchMode::Exact).with_field(QueryField::Prompt);
        assert!(matches(&rec, &spec));

        let spec = QuerySpec::new(["pony"], MatchMode::Exact).with_field(QueryField::Model);
        assert!(matches(&rec, &spec));
    }

    #[test]
    fn test_all_mode_requires_every_term() {
        let mut rec = record();
        let spec = QuerySpec::new(["pony", "anime"], MatchMode::All).with_field(QueryField::Prompt);
        assert!(matches(&rec, &spec));

        rec.prompt = Some("anime style art".to_string());
        assert!(!matches(&rec, &spec));
    }

    #[test]
    fn test_any_mode() {
        let rec = record();
        assert!(matches(&rec, &QuerySpec::new(["missing", "blurry"], MatchMode::Any)));
        assert!(!matches(&rec, &QuerySpec::new(["missing"], MatchMode::Any)));
        assert!(!matches(
            &rec,
            &QuerySpec::new(["blurry"], MatchMode::Any).with_field(QueryField::Prompt)
        ));
    }

    #[test]
    fn test_case_sensitivity() {
        let rec = record();
        let spec = QuerySpec::new(["ANIME"], MatchMode::Any);
        assert!(matches(&rec, &spec));
        assert!(!matches(&rec, &spec.clone().with_case_sensitive(true)));
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let rec = record();
        assert!(!matches(&rec, &QuerySpec::new(Vec::<String>::new(), MatchMode::Any)));
        assert!(!matches(&rec, &QuerySpec::new(["  "], MatchMode::All)));
    }

    #[test]
    fn test_numeric_setting_terms() {
        let rec = record();
        let spec = QuerySpec::new(["cfg=7"], MatchMode::Any).with_field(QueryField::Settings);
        assert!(matches(&rec, &spec));

        let spec = QuerySpec::new(["steps=31"], MatchMode::Any);
        assert!(!matches(&rec, &spec));

        let spec = QuerySpec::new(["sampler=euler a"], MatchMode::Exact).with_field(QueryField::Settings);
        assert!(matches(&rec, &spec));
    }

    #[test]
    fn test_raw_text_searchable() {
        let rec = MetadataRecord {
            raw_text: Some("Comment: made with pony".to_string()),
            ..MetadataRecord::default()
        };
        assert!(matches(&rec, &QuerySpec::new(["pony"], MatchMode::Any)));
        assert!(!matches(
            &rec,
            &QuerySpec::new(["pony"], MatchMode::Any).with_field(QueryField::Model)
        ));
    }

    #[test]
    fn test_regex_terms() {
        let rec = record();
        let spec = QuerySpec::new([r"pony\s+art$"], MatchMode::Any).with_regex(true);
        assert!(matches(&rec, &spec));

        let spec = QuerySpec::new([r"^style[AB]$"], MatchMode::All)
            .with_field(QueryField::Lora)
            .with_regex(true);
        assert!(matches(&rec, &spec));

        // Without regex mode the pattern is a literal substring
        let spec = QuerySpec::new([r"^style[AB]$"], MatchMode::Any);
        assert!(!matches(&rec, &spec));

        // EXACT anchors each pattern to the whole value
        let spec = QuerySpec::new([r"style."], MatchMode::Exact)
            .with_field(QueryField::Lora)
            .with_regex(true);
        assert!(matches(&rec, &spec));
        let spec = QuerySpec::new([r"style"], MatchMode::Exact)
            .with_field(QueryField::Lora)
            .with_regex(true);
        assert!(!matches(&rec, &spec));
    }

    #[test]
    fn test_regex_case_and_validation() {
        let rec = record();
        let spec = QuerySpec::new([r"ANIME\s+STYLE"], MatchMode::Any).with_regex(true);
        assert!(matches(&rec, &spec));
        assert!(!matches(&rec, &spec.clone().with_case_sensitive(true)));

        let bad = QuerySpec::new(["(unclosed"], MatchMode::Any).with_regex(true);
        assert!(matches!(bad.validate(), Err(SorterError::Config(_))));
        assert!(QuerySpec::new(["(unclosed"], MatchMode::Any).validate().is_ok());
    }

    #[test]
    fn test_first_matching_term() {
        let rec = record();
        let spec = QuerySpec::new(["missing", "styleA", "pony"], MatchMode::Any);
        assert_eq!(first_matching_term(&rec, &spec), Some("styleA"));
        assert_eq!(first_matching_term(&rec, &QuerySpec::new(["nope"], MatchMode::Any)), None);
    }
}

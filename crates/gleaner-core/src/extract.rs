//! Declarative fallback-rule extraction over [`PageContent`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::content::{PageContent, normalize_key};
use crate::error::AppError;
use crate::traits::ContentParser;

/// One candidate location for a field's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    /// Label lookup, case- and separator-insensitive.
    Key(String),
    /// First entry whose normalized key contains the needle.
    Contains { contains: String },
}

impl Selector {
    pub fn key(label: impl Into<String>) -> Self {
        Selector::Key(label.into())
    }

    pub fn contains(needle: impl Into<String>) -> Self {
        Selector::Contains {
            contains: needle.into(),
        }
    }

    fn candidates<'a>(&self, content: &'a PageContent) -> Vec<&'a str> {
        match self {
            Selector::Key(label) => content.get_all(label).collect(),
            Selector::Contains { contains } => content.keys_containing(contains).collect(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Selector::Key(s) => normalize_key(s).is_empty(),
            Selector::Contains { contains } => normalize_key(contains).is_empty(),
        }
    }
}

/// Ordered candidate selectors for one logical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub field: String,
    pub candidates: Vec<Selector>,
}

impl ExtractionRule {
    pub fn new(field: impl Into<String>, candidates: Vec<Selector>) -> Self {
        Self {
            field: field.into(),
            candidates,
        }
    }

    /// Shorthand for a rule made of plain labels.
    pub fn labels(field: impl Into<String>, labels: &[&str]) -> Self {
        Self::new(field, labels.iter().map(|l| Selector::key(*l)).collect())
    }
}

/// Every field to extract, plus values that count as "nothing there".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldExtractionRuleSet {
    pub rules: Vec<ExtractionRule>,
    /// Values such as `N/A` that fall through to the next candidate.
    #[serde(default)]
    pub placeholders: Vec<String>,
}

impl FieldExtractionRuleSet {
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self {
            rules,
            placeholders: Vec::new(),
        }
    }

    pub fn with_placeholders<I, S>(mut self, placeholders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.placeholders = placeholders.into_iter().map(Into::into).collect();
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.field.as_str())
    }

    /// Reject rule sets that could never behave sensibly.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.field.trim().is_empty() {
                return Err(AppError::ConfigError(
                    "extraction rule with empty field name".into(),
                ));
            }
            if !seen.insert(rule.field.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "duplicate extraction rule for field '{}'",
                    rule.field
                )));
            }
            if rule.candidates.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "field '{}' has no candidate selectors",
                    rule.field
                )));
            }
            if rule.candidates.iter().any(Selector::is_blank) {
                return Err(AppError::ConfigError(format!(
                    "field '{}' has a blank selector",
                    rule.field
                )));
            }
        }
        Ok(())
    }

    fn is_placeholder(&self, value: &str) -> bool {
        self.placeholders
            .iter()
            .any(|p| p.trim().eq_ignore_ascii_case(value))
    }
}

/// Extracted value, or the explicit "not found" sentinel.
///
/// `Found("")` never occurs: blank values fall through the candidate chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExtractedValue {
    Found(String),
    NotFound,
}

impl ExtractedValue {
    pub fn as_found(&self) -> Option<&str> {
        match self {
            ExtractedValue::Found(v) => Some(v),
            ExtractedValue::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ExtractedValue::Found(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// First candidate matched.
    Matched,
    /// A later candidate matched.
    Fallback,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFieldResult {
    pub field: String,
    pub value: ExtractedValue,
    /// Index of the candidate that matched.
    pub rule_index: Option<usize>,
    pub confidence: Confidence,
}

/// Resolve every field of `ruleset` against `content`.
///
/// Never fails: a field with no usable candidate is reported as
/// [`ExtractedValue::NotFound`].
pub fn resolve_fields(
    content: &PageContent,
    ruleset: &FieldExtractionRuleSet,
) -> BTreeMap<String, ExtractedFieldResult> {
    ruleset
        .rules
        .iter()
        .map(|rule| (rule.field.clone(), resolve_field(content, rule, ruleset)))
        .collect()
}

fn resolve_field(
    content: &PageContent,
    rule: &ExtractionRule,
    ruleset: &FieldExtractionRuleSet,
) -> ExtractedFieldResult {
    for (index, selector) in rule.candidates.iter().enumerate() {
        let hit = selector
            .candidates(content)
            .into_iter()
            .map(str::trim)
            .find(|v| !v.is_empty() && !ruleset.is_placeholder(v));

        if let Some(value) = hit {
            return ExtractedFieldResult {
                field: rule.field.clone(),
                value: ExtractedValue::Found(value.to_string()),
                rule_index: Some(index),
                confidence: if index == 0 {
                    Confidence::Matched
                } else {
                    Confidence::Fallback
                },
            };
        }
    }

    ExtractedFieldResult {
        field: rule.field.clone(),
        value: ExtractedValue::NotFound,
        rule_index: None,
        confidence: Confidence::Missing,
    }
}

/// Parses raw page text and resolves a rule set against it.
#[derive(Debug, Clone)]
pub struct FieldExtractor<P: ContentParser> {
    parser: P,
    ruleset: FieldExtractionRuleSet,
}

impl<P: ContentParser> FieldExtractor<P> {
    pub fn new(parser: P, ruleset: FieldExtractionRuleSet) -> Self {
        Self { parser, ruleset }
    }

    /// Fails only when the raw content cannot be parsed at all.
    pub fn extract(&self, raw: &str) -> Result<BTreeMap<String, ExtractedFieldResult>, AppError> {
        let content = self.parser.parse(raw)?;
        Ok(resolve_fields(&content, &self.ruleset))
    }
}

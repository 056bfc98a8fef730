//! Tolerance comparison between known and extracted field values.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::extract::{ExtractedFieldResult, ExtractedValue};
use crate::models::FieldMap;

/// Named comparison policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceRule {
    /// Byte equality.
    Exact,
    /// Equal after lowercasing and trimming.
    #[default]
    CaseInsensitive,
    /// Either value contains the other after lowercasing and trimming.
    Substring,
    /// Both values map to the same canonical token through the alias table.
    NormalizedAlias,
}

impl ToleranceRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToleranceRule::Exact => "exact",
            ToleranceRule::CaseInsensitive => "case_insensitive",
            ToleranceRule::Substring => "substring",
            ToleranceRule::NormalizedAlias => "normalized_alias",
        }
    }
}

impl fmt::Display for ToleranceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToleranceRule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(ToleranceRule::Exact),
            "case_insensitive" => Ok(ToleranceRule::CaseInsensitive),
            "substring" => Ok(ToleranceRule::Substring),
            "normalized_alias" => Ok(ToleranceRule::NormalizedAlias),
            other => Err(AppError::ConfigError(format!(
                "unknown tolerance rule '{other}'"
            ))),
        }
    }
}

/// Lowercase and strip whitespace, `-` and `_`.
fn alias_token(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Variant → canonical token lookup.
///
/// Configured as `{ "FFPE": ["Formalin-Fixed Paraffin-Embedded", "ffpe"] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct AliasTable {
    groups: BTreeMap<String, Vec<String>>,
    index: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group<I, S>(mut self, canonical: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let canonical = canonical.into();
        let variants: Vec<String> = variants.into_iter().map(Into::into).collect();
        self.index
            .entry(alias_token(&canonical))
            .or_insert_with(|| canonical.clone());
        for variant in &variants {
            self.index
                .entry(alias_token(variant))
                .or_insert_with(|| canonical.clone());
        }
        self.groups.entry(canonical).or_default().extend(variants);
        self
    }

    /// Canonical token for `value`; unknown values canonicalize to their
    /// normalized form.
    pub fn canonical(&self, value: &str) -> String {
        let token = alias_token(value);
        match self.index.get(&token) {
            Some(canonical) => alias_token(canonical),
            None => token,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl From<BTreeMap<String, Vec<String>>> for AliasTable {
    fn from(groups: BTreeMap<String, Vec<String>>) -> Self {
        groups
            .into_iter()
            .fold(AliasTable::new(), |table, (canonical, variants)| {
                table.with_group(canonical, variants)
            })
    }
}

impl From<AliasTable> for BTreeMap<String, Vec<String>> {
    fn from(table: AliasTable) -> Self {
        table.groups
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonStatus {
    Match,
    Mismatch,
    /// Known value present, nothing extracted.
    Missing,
    /// No known value to compare against.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub field: String,
    pub status: ComparisonStatus,
    pub known: Option<String>,
    pub extracted: Option<String>,
    pub rule: ToleranceRule,
}

/// Compare one field. Pure and total.
pub fn compare(
    field: &str,
    known: Option<&str>,
    extracted: &ExtractedValue,
    rule: ToleranceRule,
    aliases: &AliasTable,
) -> ComparisonResult {
    let known = known.filter(|k| !k.trim().is_empty());
    let extracted_value = extracted.as_found();

    let status = match (known, extracted_value) {
        (None, _) => ComparisonStatus::Skipped,
        (Some(_), None) => ComparisonStatus::Missing,
        (Some(k), Some(e)) => {
            if values_match(k, e, rule, aliases) {
                ComparisonStatus::Match
            } else {
                ComparisonStatus::Mismatch
            }
        }
    };

    ComparisonResult {
        field: field.to_string(),
        status,
        known: known.map(str::to_string),
        extracted: extracted_value.map(str::to_string),
        rule,
    }
}

fn values_match(known: &str, extracted: &str, rule: ToleranceRule, aliases: &AliasTable) -> bool {
    match rule {
        ToleranceRule::Exact => known == extracted,
        ToleranceRule::CaseInsensitive => {
            known.trim().to_lowercase() == extracted.trim().to_lowercase()
        }
        ToleranceRule::Substring => {
            let k = known.trim().to_lowercase();
            let e = extracted.trim().to_lowercase();
            k.contains(&e) || e.contains(&k)
        }
        ToleranceRule::NormalizedAlias => aliases.canonical(known) == aliases.canonical(extracted),
    }
}

/// Which rule applies to which field, plus the alias table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonPolicy {
    #[serde(default)]
    pub default_rule: ToleranceRule,
    /// Per-field overrides.
    #[serde(default)]
    pub fields: BTreeMap<String, ToleranceRule>,
    #[serde(default)]
    pub aliases: AliasTable,
}

impl ComparisonPolicy {
    pub fn new(default_rule: ToleranceRule) -> Self {
        Self {
            default_rule,
            ..Default::default()
        }
    }

    pub fn with_field_rule(mut self, field: impl Into<String>, rule: ToleranceRule) -> Self {
        self.fields.insert(field.into(), rule);
        self
    }

    pub fn with_aliases(mut self, aliases: AliasTable) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn rule_for(&self, field: &str) -> ToleranceRule {
        self.fields.get(field).copied().unwrap_or(self.default_rule)
    }

    /// Compare every extracted field against the record's known values.
    pub fn compare_record(
        &self,
        known: &FieldMap,
        extracted: &BTreeMap<String, ExtractedFieldResult>,
    ) -> Vec<ComparisonResult> {
        extracted
            .iter()
            .map(|(field, result)| {
                compare(
                    field,
                    known.get(field).map(String::as_str),
                    &result.value,
                    self.rule_for(field),
                    &self.aliases,
                )
            })
            .collect()
    }
}

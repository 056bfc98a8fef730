use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compare::ComparisonPolicy;
use crate::content::JsonContentParser;
use crate::error::AppError;
use crate::extract::FieldExtractionRuleSet;

/// Declarative enrichment setup: what to extract, how to compare it, and
/// where the data lives in fetched content.
///
/// ```json
/// {
///   "extraction": {
///     "rules": [
///       {"field": "magnification", "candidates": ["Objective Magnification", "Magnification"]}
///     ],
///     "placeholders": ["N/A"]
///   },
///   "comparison": {"default_rule": "case_insensitive", "fields": {"organ": "substring"}},
///   "content_root": "/props/pageProps/dataset"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    pub extraction: FieldExtractionRuleSet,
    #[serde(default)]
    pub comparison: ComparisonPolicy,
    /// JSON pointer to the record data inside structured page content.
    #[serde(default)]
    pub content_root: Option<String>,
}

impl EnrichmentConfig {
    /// Load and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_json(&text).map_err(|e| match e {
            AppError::ConfigError(msg) => {
                AppError::ConfigError(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| AppError::ConfigError(format!("Invalid enrichment config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.extraction.validate()?;
        if self.extraction.rules.is_empty() {
            return Err(AppError::ConfigError("no extraction rules configured".into()));
        }
        if let Some(root) = &self.content_root
            && !root.is_empty()
            && !root.starts_with('/')
        {
            return Err(AppError::ConfigError(format!(
                "content_root must be a JSON pointer starting with '/', got '{root}'"
            )));
        }
        for field in self.comparison.fields.keys() {
            if !self.extraction.field_names().any(|f| f == field) {
                tracing::warn!(%field, "Comparison rule for a field with no extraction rule");
            }
        }
        Ok(())
    }

    /// Parser for pages whose content is a JSON document.
    pub fn json_parser(&self) -> JsonContentParser {
        match self.content_root.as_deref().filter(|r| !r.is_empty()) {
            Some(root) => JsonContentParser::new().with_root(root),
            None => JsonContentParser::new(),
        }
    }
}

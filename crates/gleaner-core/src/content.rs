//! Opaque key→value view of a fetched page.
//!
//! Parsers (see [`crate::traits::ContentParser`]) turn raw page text into a
//! [`PageContent`]; the field extractor only ever looks at this mapping, so
//! extraction rules can be tested without a live page.

use std::collections::HashMap;

use crate::error::AppError;
use crate::traits::ContentParser;

/// Normalize a label for lookup.
///
/// Lowercases, splits camelCase, and collapses `_`, `-` and whitespace runs
/// into single spaces: `objectiveMagnification`, `objective_magnification`
/// and `Objective  Magnification` all become `objective magnification`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    let mut pending_space = false;

    for ch in key.trim().chars() {
        if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_space = !out.is_empty();
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            pending_space = true;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.extend(ch.to_lowercase());
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
    }
    out
}

/// Ordered key→value mapping with case- and separator-insensitive lookup.
///
/// A label may repeat (a placeholder row followed by the real one); every
/// distinct value is kept so extraction can skip blanks and placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContent {
    entries: Vec<(String, String)>,
    /// Normalized key -> entry positions, in insertion order.
    index: HashMap<String, Vec<usize>>,
}

impl PageContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut content = Self::new();
        for (k, v) in pairs {
            content.insert(k, v);
        }
        content
    }

    /// Insert an entry. A value already stored under the same normalized
    /// key is not added twice.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let normalized = normalize_key(&key);
        if normalized.is_empty() {
            return;
        }
        let slots = self.index.entry(normalized).or_default();
        if slots.iter().any(|&i| self.entries[i].1 == value) {
            return;
        }
        slots.push(self.entries.len());
        self.entries.push((key, value));
    }

    /// First value stored under a label, ignoring case and separators.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).next()
    }

    /// Every value stored under a label, in insertion order.
    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.index
            .get(&normalize_key(key))
            .into_iter()
            .flatten()
            .map(move |&i| self.entries[i].1.as_str())
    }

    /// Iterate over entries whose normalized key contains `needle`
    /// (normalized the same way), in insertion order.
    pub fn keys_containing<'a>(&'a self, needle: &str) -> impl Iterator<Item = &'a str> + 'a {
        let needle = normalize_key(needle);
        self.entries
            .iter()
            .filter(move |(k, _)| !needle.is_empty() && normalize_key(k).contains(&needle))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten a JSON value into entries.
    ///
    /// Object leaves are stored under their dotted path and under their bare
    /// key. Arrays of scalars are joined with `", "`. Multi-line string
    /// leaves are additionally harvested for Markdown key/value lines.
    pub fn absorb_json(&mut self, value: &serde_json::Value) {
        let mut harvest = Vec::new();
        self.flatten(value, "", None, &mut harvest);
        for text in harvest {
            self.absorb_markdown(&text);
        }
    }

    fn flatten(
        &mut self,
        value: &serde_json::Value,
        path: &str,
        leaf: Option<&str>,
        harvest: &mut Vec<String>,
    ) {
        use serde_json::Value;

        match value {
            Value::Null => {}
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    self.flatten(child, &child_path, Some(key), harvest);
                }
            }
            Value::Array(items) => {
                if items.iter().all(|v| !v.is_object() && !v.is_array()) {
                    let joined = items
                        .iter()
                        .filter_map(scalar_to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    self.insert_leaf(path, leaf, joined);
                } else {
                    for (i, child) in items.iter().enumerate() {
                        self.flatten(child, &format!("{path}.{i}"), leaf, harvest);
                    }
                }
            }
            scalar => {
                if let Some(text) = scalar_to_string(scalar) {
                    if text.contains('\n') {
                        harvest.push(text.clone());
                    }
                    self.insert_leaf(path, leaf, text);
                }
            }
        }
    }

    fn insert_leaf(&mut self, path: &str, leaf: Option<&str>, value: String) {
        if path.is_empty() {
            return;
        }
        if let Some(leaf) = leaf
            && leaf != path
        {
            self.insert(leaf, value.clone());
        }
        self.insert(path, value);
    }

    /// Harvest `Key: Value` lines and `**Section**` blocks from Markdown text.
    ///
    /// ```text
    /// **Biomaterials**
    /// Human pancreas tissue      -> ("Biomaterials", "Human pancreas tissue")
    /// **Imaging**
    /// - Objective Magnification: 20X  -> ("Objective Magnification", "20X")
    /// ```
    pub fn absorb_markdown(&mut self, text: &str) {
        for (key, value) in harvest_markdown_pairs(text) {
            self.insert(key, value);
        }
    }
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extract key/value pairs from Markdown-ish text. See
/// [`PageContent::absorb_markdown`].
pub fn harvest_markdown_pairs(text: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut section: Option<String> = None;
    let mut section_filled = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(heading) = section_heading(line) {
            section = Some(heading);
            section_filled = false;
            continue;
        }

        let item = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line)
            .trim();

        if let Some((key, value)) = item.split_once(':') {
            let key = key.trim().trim_matches('*').trim();
            let value = value.trim().trim_start_matches('*').trim();
            if !key.is_empty() && !value.is_empty() && key.split_whitespace().count() <= 6 {
                pairs.push((key.to_string(), value.to_string()));
                continue;
            }
        }

        if let Some(name) = &section
            && !section_filled
        {
            pairs.push((name.clone(), item.to_string()));
            section_filled = true;
        }
    }
    pairs
}

/// `**Imaging**`, `**Imaging:**` or `# Imaging` → `Some("Imaging")`.
fn section_heading(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix('#') {
        let name = rest.trim_start_matches('#').trim();
        return (!name.is_empty()).then(|| name.to_string());
    }
    let inner = line.strip_prefix("**")?.strip_suffix("**")?;
    if inner.contains("**") {
        return None;
    }
    let name = inner.trim().trim_end_matches(':').trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Parses page text that is itself a JSON document.
///
/// An optional JSON pointer (`/props/pageProps/dataset`) selects the subtree
/// that holds the record's data.
#[derive(Debug, Clone, Default)]
pub struct JsonContentParser {
    root: Option<String>,
}

impl JsonContentParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, pointer: impl Into<String>) -> Self {
        self.root = Some(pointer.into());
        self
    }

    /// Flatten an already-parsed document.
    pub fn parse_value(&self, document: &serde_json::Value) -> Result<PageContent, AppError> {
        let subtree = match &self.root {
            Some(pointer) => document.pointer(pointer).ok_or_else(|| {
                AppError::ExtractionError(format!("content has no value at '{pointer}'"))
            })?,
            None => document,
        };
        if !subtree.is_object() {
            return Err(AppError::ExtractionError(
                "content root is not a JSON object".into(),
            ));
        }

        let mut content = PageContent::new();
        content.absorb_json(subtree);
        Ok(content)
    }
}

impl ContentParser for JsonContentParser {
    fn parse(&self, raw: &str) -> Result<PageContent, AppError> {
        let document: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| AppError::ExtractionError(format!("content is not valid JSON: {e}")))?;
        self.parse_value(&document)
    }
}

//! HTML page parsers producing [`PageContent`].

use std::sync::Arc;

use gleaner_core::content::{JsonContentParser, PageContent};
use gleaner_core::error::AppError;
use gleaner_core::traits::ContentParser;
use htmd::HtmlToMarkdown;
use scraper::{Html, Selector};

const NEXT_DATA_SELECTOR: &str = "script#__NEXT_DATA__";

/// Reads the JSON a Next.js page embeds in `<script id="__NEXT_DATA__">`.
#[derive(Debug, Clone, Default)]
pub struct NextDataParser {
    json: JsonContentParser,
}

impl NextDataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `json` (typically carrying a content root such as
    /// `/props/pageProps/dataset`) to flatten the embedded document.
    pub fn with_json_parser(json: JsonContentParser) -> Self {
        Self { json }
    }

    fn embedded_json(html: &str) -> Result<serde_json::Value, AppError> {
        let selector = Selector::parse(NEXT_DATA_SELECTOR)
            .map_err(|e| AppError::ExtractionError(format!("bad selector: {e}")))?;
        let document = Html::parse_document(html);
        let script = document
            .select(&selector)
            .next()
            .ok_or_else(|| AppError::ExtractionError("page has no __NEXT_DATA__ script".into()))?;
        let text: String = script.text().collect();
        serde_json::from_str(&text)
            .map_err(|e| AppError::ExtractionError(format!("__NEXT_DATA__ is not valid JSON: {e}")))
    }
}

impl ContentParser for NextDataParser {
    fn parse(&self, raw: &str) -> Result<PageContent, AppError> {
        let document = Self::embedded_json(raw)?;
        self.json.parse_value(&document)
    }
}

/// Converts HTML to Markdown and harvests `Key: Value` lines and
/// `**Section**` blocks from the rendered text.
pub struct MarkdownPageParser {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for MarkdownPageParser {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl MarkdownPageParser {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    pub fn to_markdown(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map_err(|e| AppError::ExtractionError(format!("HTML conversion failed: {e}")))
    }
}

impl Default for MarkdownPageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentParser for MarkdownPageParser {
    fn parse(&self, raw: &str) -> Result<PageContent, AppError> {
        let markdown = self.to_markdown(raw)?;
        let mut content = PageContent::new();
        content.absorb_markdown(&markdown);
        Ok(content)
    }
}

/// Default parser for dataset pages.
///
/// Tries, in order: the body as a JSON document, embedded Next.js data, and
/// Markdown harvesting of the rendered HTML. Only when none of them yields a
/// single entry is the page an [`AppError::ExtractionError`].
#[derive(Clone, Default)]
pub struct PageParser {
    json: JsonContentParser,
    next_data: NextDataParser,
    markdown: MarkdownPageParser,
}

impl PageParser {
    pub fn new(json: JsonContentParser) -> Self {
        Self {
            next_data: NextDataParser::with_json_parser(json.clone()),
            json,
            markdown: MarkdownPageParser::new(),
        }
    }
}

impl ContentParser for PageParser {
    fn parse(&self, raw: &str) -> Result<PageContent, AppError> {
        let structured = if raw.trim_start().starts_with('{') {
            self.json.parse(raw)
        } else {
            self.next_data.parse(raw)
        };

        match structured {
            Ok(content) if !content.is_empty() => return Ok(content),
            Ok(_) => tracing::debug!("Structured page data is empty, falling back to Markdown"),
            Err(e) => tracing::debug!(error = %e, "No structured page data, falling back to Markdown"),
        }

        let content = self.markdown.parse(raw)?;
        if content.is_empty() {
            return Err(AppError::ExtractionError(
                "page yielded no key/value content".into(),
            ));
        }
        Ok(content)
    }
}

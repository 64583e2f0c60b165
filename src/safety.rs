//! Keyword gate that halts execution on pages that look like they commit something.

use crate::dom;
use crate::surface::PageSurface;

/// Matched case-insensitively anywhere in the page title and body text.
pub const RISK_KEYWORDS: &[&str] = &[
    "purchase",
    "buy",
    "pay",
    "send",
    "delete",
    "confirm",
    "submit order",
];

pub struct SafetyGate {
    keywords: Vec<String>,
    max_chars: usize,
}

impl SafetyGate {
    pub fn new(max_chars: usize) -> Self {
        Self {
            keywords: RISK_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            max_chars,
        }
    }

    /// Keywords present in `text`, in keyword-list order.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let haystack = dom::truncate_chars(text, self.max_chars).to_lowercase();
        self.keywords
            .iter()
            .filter(|k| haystack.contains(k.as_str()))
            .cloned()
            .collect()
    }

    /// Scan the page's visible text. `Err` means the page could not be read.
    pub async fn scan(&self, surface: &dyn PageSurface) -> anyhow::Result<Vec<String>> {
        let value = surface
            .evaluate(&dom::visible_text_script(self.max_chars))
            .await?;
        let text = value.as_str().unwrap_or_default();
        Ok(self.matches(text))
    }
}

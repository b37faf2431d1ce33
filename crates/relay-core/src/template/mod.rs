//! Integration-configuration (ICF) templates
//!
//! A template is a base document in one of two formats:
//!
//! - placeholders: an opaque document containing `${KEY}` tokens
//! - properties: `key=value` lines below a `## ----` header, where every
//!   entry (commented out or not) is a key the environment must supply
//!
//! Extraction records the set of distinct keys; merging fills them from an
//! environment's override set.

pub mod discover;
pub mod merge;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use discover::{DiscoveredTemplate, TemplateOrigin, TemplateSearch, TemplateStatus, discover};
pub use merge::{ResolvedConfig, merge, suggest_overrides};

/// File extensions read as properties templates.
pub const PROPERTIES_SUFFIXES: &[&str] = &["properties", "cfg", "conf", "ini", "env", "txt"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFormat {
    #[default]
    Placeholders,
    Properties,
}

impl TemplateFormat {
    /// Format of a template file. Documents with `${KEY}` tokens are always
    /// placeholder templates, whatever their extension.
    pub fn detect(path: &Path, raw: &str) -> Self {
        if !placeholders(raw).is_empty() {
            return TemplateFormat::Placeholders;
        }
        if has_properties_suffix(path) {
            TemplateFormat::Properties
        } else {
            TemplateFormat::Placeholders
        }
    }
}

pub(crate) fn has_properties_suffix(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            PROPERTIES_SUFFIXES
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}

/// Base document plus the override keys it requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcfTemplate {
    base_content: String,
    required_keys: BTreeSet<String>,
    #[serde(default)]
    format: TemplateFormat,
}

impl IcfTemplate {
    /// Parse a raw placeholder document. Pure and idempotent.
    pub fn extract(raw: &str) -> Self {
        let required_keys = placeholders(raw)
            .into_iter()
            .map(|p| p.key.to_string())
            .collect();
        Self {
            base_content: raw.to_string(),
            required_keys,
            format: TemplateFormat::Placeholders,
        }
    }

    /// Parse a raw properties document.
    pub fn extract_properties(raw: &str) -> Self {
        let required_keys = property_entries(raw)
            .into_iter()
            .map(|entry| entry.key.to_string())
            .collect();
        Self {
            base_content: raw.to_string(),
            required_keys,
            format: TemplateFormat::Properties,
        }
    }

    pub fn parse(raw: &str, format: TemplateFormat) -> Self {
        match format {
            TemplateFormat::Placeholders => Self::extract(raw),
            TemplateFormat::Properties => Self::extract_properties(raw),
        }
    }

    /// The template of an artifact that ships none.
    pub fn empty() -> Self {
        Self::extract("")
    }

    pub fn format(&self) -> TemplateFormat {
        self.format
    }

    /// Non-blank lines below the header of a properties template.
    pub fn excerpt(&self) -> Option<String> {
        if self.format != TemplateFormat::Properties {
            return None;
        }
        let lines: Vec<&str> = self.base_content.lines().collect();
        let body: Vec<&str> = lines[header_end(&lines)..]
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.trim_end())
            .collect();
        (!body.is_empty()).then(|| body.join("\n"))
    }

    pub fn base_content(&self) -> &str {
        &self.base_content
    }

    pub fn required_keys(&self) -> &BTreeSet<String> {
        &self.required_keys
    }

    /// True when at least one environment override must be supplied.
    pub fn requires_overrides(&self) -> bool {
        !self.required_keys.is_empty()
    }

    /// Whether the base document is JSON, in which case values are escaped on merge.
    pub fn is_json(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.base_content).is_ok()
    }
}

/// A `${KEY}` occurrence; `start..end` covers the whole token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placeholder<'a> {
    pub key: &'a str,
    pub start: usize,
    pub end: usize,
}

/// Scan a document for placeholders, in order of appearance.
///
/// Keys are ASCII alphanumerics plus `_`, `-` and `.`. Anything else between
/// `${` and `}` is left as literal text.
pub(crate) fn placeholders(doc: &str) -> Vec<Placeholder<'_>> {
    let bytes = doc.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'$' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }

        let key_start = i + 2;
        let mut j = key_start;
        while j < bytes.len() && is_key_byte(bytes[j]) {
            j += 1;
        }

        if j > key_start && j < bytes.len() && bytes[j] == b'}' {
            found.push(Placeholder {
                key: &doc[key_start..j],
                start: i,
                end: j + 1,
            });
            i = j + 1;
        } else {
            i += 2;
        }
    }

    found
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

/// A `key=value` line of a properties template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PropertyEntry<'a> {
    /// Index into `doc.lines()`.
    pub line: usize,
    pub key: &'a str,
    pub value: &'a str,
}

/// First line after the `## ----` header, or 0 when there is none.
fn header_end(lines: &[&str]) -> usize {
    lines
        .iter()
        .position(|line| line.trim().starts_with("##") && line.contains("----"))
        .map_or(0, |idx| idx + 1)
}

/// Entries below the header. `#key=value` lines count as entries;
/// `##` lines are notes.
pub(crate) fn property_entries(doc: &str) -> Vec<PropertyEntry<'_>> {
    let lines: Vec<&str> = doc.lines().collect();
    let start = header_end(&lines);

    lines
        .iter()
        .enumerate()
        .skip(start)
        .filter_map(|(line, raw)| {
            let stripped = raw.trim();
            if stripped.starts_with("##") {
                return None;
            }
            let (key, value) = stripped.trim_start_matches('#').trim().split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| PropertyEntry {
                line,
                key,
                value: value.trim(),
            })
        })
        .collect()
}

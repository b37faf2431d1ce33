//! Merge override sets into templates.

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::MergeError;
use crate::overrides::OverrideSet;

use super::{IcfTemplate, TemplateFormat, placeholders, property_entries};

/// A template with every placeholder filled for one environment.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    environment: String,
    content: String,
    fingerprint: String,
}

impl ResolvedConfig {
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The merged document. Contains secret values.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// blake3 digest of the merged document, safe to persist and log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("environment", &self.environment)
            .field("content", &format_args!("<{} bytes redacted>", self.content.len()))
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Fill `template` from `overrides`.
///
/// Every required key must have a value; keys present only in the override
/// set are ignored. On failure the error lists all missing keys at once.
pub fn merge(template: &IcfTemplate, overrides: &OverrideSet) -> Result<ResolvedConfig, MergeError> {
    let missing_keys: Vec<String> = template
        .required_keys()
        .iter()
        .filter(|key| !overrides.contains_key(key.as_str()))
        .cloned()
        .collect();
    if !missing_keys.is_empty() {
        return Err(MergeError {
            environment: overrides.environment().to_string(),
            missing_keys,
        });
    }

    let content = match template.format() {
        TemplateFormat::Placeholders => fill_placeholders(template, overrides),
        TemplateFormat::Properties => fill_properties(template.base_content(), overrides),
    };

    let fingerprint = blake3::hash(content.as_bytes()).to_hex().to_string();
    Ok(ResolvedConfig {
        environment: overrides.environment().to_string(),
        content,
        fingerprint,
    })
}

fn fill_placeholders(template: &IcfTemplate, overrides: &OverrideSet) -> String {
    let doc = template.base_content();
    let escape_json = template.is_json();
    let mut content = String::with_capacity(doc.len());
    let mut cursor = 0;

    for placeholder in placeholders(doc) {
        content.push_str(&doc[cursor..placeholder.start]);
        match overrides.get(placeholder.key) {
            Some(value) if escape_json => content.push_str(&json_escape(value)),
            Some(value) => content.push_str(value),
            None => content.push_str(&doc[placeholder.start..placeholder.end]),
        }
        cursor = placeholder.end;
    }
    content.push_str(&doc[cursor..]);
    content
}

// Each entry line becomes an active `key=value`; every other line is kept as is.
fn fill_properties(doc: &str, overrides: &OverrideSet) -> String {
    let entries = property_entries(doc);
    let mut entries = entries.iter().peekable();
    let mut content = String::with_capacity(doc.len());

    // split_inclusive yields the same lines as lines(), terminators included
    for (idx, line) in doc.split_inclusive('\n').enumerate() {
        let entry = entries.next_if(|entry| entry.line == idx);
        match entry.and_then(|entry| overrides.get(entry.key).map(|value| (entry.key, value))) {
            Some((key, value)) => {
                let body = line.trim_end_matches(['\r', '\n']);
                content.push_str(key);
                content.push('=');
                content.push_str(&properties_escape(value));
                content.push_str(&line[body.len()..]);
            }
            None => content.push_str(line),
        }
    }
    content
}

/// Override template an operator can copy into the environment's secret.
///
/// Values are instructions, never real secrets.
pub fn suggest_overrides(required_keys: &BTreeSet<String>, environment: &str) -> Map<String, Value> {
    required_keys
        .iter()
        .map(|key| {
            (
                key.clone(),
                Value::String(format!("<set {key} for {environment}>")),
            )
        })
        .collect()
}

// Line breaks and backslashes are escapes in a properties value.
fn properties_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

// Escape for the inside of a JSON string literal.
fn json_escape(value: &str) -> String {
    let quoted = Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn overrides(env: &str, pairs: &[(&str, &str)]) -> OverrideSet {
        let values: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OverrideSet::new(env, values)
    }

    #[test]
    fn merge_fills_every_placeholder() {
        let template = IcfTemplate::extract("db=${DB_URL}\nkey=${API_KEY}\n");
        let resolved = merge(
            &template,
            &overrides("qa", &[("DB_URL", "x"), ("API_KEY", "y")]),
        )
        .unwrap();
        assert_eq!(resolved.content(), "db=x\nkey=y\n");
        assert_eq!(resolved.environment(), "qa");
    }

    #[test]
    fn merge_ignores_extra_keys() {
        let template = IcfTemplate::extract("db=${DB_URL}");
        let resolved = merge(
            &template,
            &overrides("qa", &[("DB_URL", "x"), ("UNRELATED", "z")]),
        )
        .unwrap();
        assert_eq!(resolved.content(), "db=x");
    }

    #[test]
    fn merge_reports_all_missing_keys() {
        let template = IcfTemplate::extract("${C} ${A} ${B}");
        let err = merge(&template, &overrides("prod", &[("B", "1")])).unwrap_err();
        assert_eq!(err.environment, "prod");
        assert_eq!(err.missing_keys, vec!["A", "C"]);
    }

    #[test]
    fn merge_escapes_values_in_json_documents() {
        let template = IcfTemplate::extract(r#"{"password": "${PASSWORD}"}"#);
        let resolved = merge(
            &template,
            &overrides("qa", &[("PASSWORD", "p\"w\\d\n")]),
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(resolved.content()).unwrap();
        assert_eq!(parsed["password"], "p\"w\\d\n");
    }

    #[test]
    fn merge_is_raw_for_non_json_documents() {
        let template = IcfTemplate::extract("port: ${PORT}");
        let resolved = merge(&template, &overrides("qa", &[("PORT", "\"8080\"")])).unwrap();
        assert_eq!(resolved.content(), "port: \"8080\"");
    }

    #[test]
    fn merge_activates_properties_entries() {
        let template = IcfTemplate::extract_properties(
            "# Billing\r\n## -----\r\ndb.url=jdbc:h2:mem\r\n#api.key=\r\n## keep me\r\nretries = 3",
        );
        let resolved = merge(
            &template,
            &overrides(
                "qa",
                &[("db.url", "jdbc:postgresql://qa"), ("api.key", "k\\1"), ("retries", "5")],
            ),
        )
        .unwrap();
        assert_eq!(
            resolved.content(),
            "# Billing\r\n## -----\r\ndb.url=jdbc:postgresql://qa\r\napi.key=k\\\\1\r\n## keep me\r\nretries=5"
        );
    }

    #[test]
    fn merge_reports_missing_properties_keys() {
        let template = IcfTemplate::extract_properties("## ----\na=\n#b=2\n");
        let err = merge(&template, &overrides("prod", &[("a", "1")])).unwrap_err();
        assert_eq!(err.missing_keys, vec!["b"]);
    }

    #[test]
    fn properties_values_keep_one_line_each() {
        let template = IcfTemplate::extract_properties("motd=\n");
        let resolved = merge(&template, &overrides("qa", &[("motd", "a\nb")])).unwrap();
        assert_eq!(resolved.content(), "motd=a\\nb\n");
    }

    #[test]
    fn fingerprint_tracks_content() {
        let template = IcfTemplate::extract("v=${V}");
        let a = merge(&template, &overrides("qa", &[("V", "1")])).unwrap();
        let b = merge(&template, &overrides("qa", &[("V", "2")])).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn debug_output_redacts_content() {
        let template = IcfTemplate::extract("secret=${S}");
        let resolved = merge(&template, &overrides("qa", &[("S", "hunter2")])).unwrap();
        assert!(!format!("{resolved:?}").contains("hunter2"));
    }

    #[test]
    fn suggestions_cover_required_keys_only() {
        let template = IcfTemplate::extract("${DB_URL} ${API_KEY}");
        let suggested = suggest_overrides(template.required_keys(), "prod");
        assert_eq!(suggested.len(), 2);
        assert_eq!(suggested["API_KEY"], "<set API_KEY for prod>");
    }
}

//! Parser for the text reply of the Redis `INFO` command
//!
//! The reply is a list of `# Section` headers followed by `field:value`
//! lines, separated by CRLF. Several replies can be concatenated and parsed
//! at once.

use std::collections::BTreeMap;

/// Parsed `INFO` reply, sections keyed by lowercase name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedisInfo {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl RedisInfo {
    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(&name.to_ascii_lowercase())
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Look up a field in any section
    pub fn get(&self, field: &str) -> Option<&str> {
        self.sections
            .values()
            .find_map(|fields| fields.get(field))
            .map(String::as_str)
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(|v| v.parse().ok())
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| v.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.values().all(BTreeMap::is_empty)
    }
}

/// Parse `INFO` output
///
/// Lines before the first header land in a section named `default`; lines
/// without a `:` are skipped.
pub fn parse_info(text: &str) -> RedisInfo {
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current = "default".to_string();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('#') {
            current = header.trim().to_ascii_lowercase();
            sections.entry(current.clone()).or_default();
            continue;
        }

        if let Some((field, value)) = line.split_once(':') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(field.trim().to_string(), value.trim().to_string());
        }
    }

    RedisInfo { sections }
}

//! Resource string lookup.
//!
//! Tasks resolve their title, description and messages through a
//! [`ResourceMap`]. Keys are `<prefix>.<name>` where the prefix identifies
//! the kind of task.

use std::collections::HashMap;

/// Source of human-readable strings.
pub trait ResourceMap: Send + Sync {
    /// Look up a raw string.
    fn get_string(&self, key: &str) -> Option<String>;

    /// Whether the key is present.
    fn contains_key(&self, key: &str) -> bool {
        self.get_string(key).is_some()
    }
}

/// In-memory resource map.
#[derive(Debug, Clone, Default)]
pub struct MapResources {
    entries: HashMap<String, String>,
}

impl MapResources {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Parse `.properties`-style text.
    ///
    /// One `key = value` (or `key: value`) pair per line; blank lines and
    /// lines starting with `#` or `!` are skipped. Lines without a separator
    /// map the key to an empty string.
    pub fn from_properties(text: &str) -> Self {
        let mut map = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line.find(['=', ':']);
            let (key, value) = match split {
                Some(idx) => (line[..idx].trim(), line[idx + 1..].trim()),
                None => (line, ""),
            };
            map.insert(key, value);
        }
        map
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceMap for MapResources {
    fn get_string(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// Substitute `{0}`, `{1}`, ... in `template` with `args`.
///
/// Placeholders without a matching argument are left as written.
pub fn format_message(template: &str, args: &[&dyn std::fmt::Display]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let index: usize = after[..close].trim().parse().ok()?;
            let arg = args.get(index)?;
            Some((arg.to_string(), close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

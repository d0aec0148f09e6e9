//! Command alias table
//!
//! Maps normalized spoken phrases to canonical command names. Aliases come
//! in two scopes: per-node sets and a global set; lookup prefers the node
//! scope so a node can shadow a global phrase.

use std::collections::HashMap;

/// Normalize spoken text for alias matching: lowercase, punctuation
/// stripped, whitespace collapsed.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lc in c.to_lowercase() {
                out.push(lc);
            }
            last_was_space = false;
        } else if (c.is_whitespace() || c == '-' || c == '\'') && !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Spoken-phrase to command-name mapping with node scoping
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    global: HashMap<String, String>,
    node_scoped: HashMap<String, HashMap<String, String>>,
}

impl AliasTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with the stock transport, recording, and routing
    /// aliases
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert_global("play", "jack_transport_start");
        table.insert_global("stop", "jack_transport_stop");
        table.insert_global("record", "record_start");
        table.insert_global("connect", "connect_jack_ports");
        table.insert_global("disconnect", "disconnect_jack_ports");
        table
    }

    /// Add or replace a global alias
    pub fn insert_global(&mut self, phrase: &str, command: &str) {
        self.global.insert(normalize(phrase), command.to_string());
    }

    /// Add or replace an alias scoped to `node_id`
    pub fn insert_node(&mut self, node_id: &str, phrase: &str, command: &str) {
        self.node_scoped
            .entry(node_id.to_string())
            .or_default()
            .insert(normalize(phrase), command.to_string());
    }

    /// Resolve a normalized phrase for `node_id`, node scope first
    #[must_use]
    pub fn resolve(&self, node_id: &str, normalized: &str) -> Option<&str> {
        self.node_scoped
            .get(node_id)
            .and_then(|m| m.get(normalized))
            .or_else(|| self.global.get(normalized))
            .map(String::as_str)
    }

    /// Total number of aliases across scopes
    #[must_use]
    pub fn len(&self) -> usize {
        self.global.len() + self.node_scoped.values().map(HashMap::len).sum::<usize>()
    }

    /// Whether the table has no aliases
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("  Play, the   SONG!  "), "play the song");
        assert_eq!(normalize("don't stop"), "don t stop");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("?!."), "");
    }

    #[test]
    fn node_scope_shadows_global() {
        let mut table = AliasTable::new();
        table.insert_global("play", "jack_transport_start");
        table.insert_node("karate", "play", "record_start");

        assert_eq!(table.resolve("indigo", "play"), Some("jack_transport_start"));
        assert_eq!(table.resolve("karate", "play"), Some("record_start"));
        assert_eq!(table.resolve("karate", "rewind"), None);
    }

    #[test]
    fn defaults_cover_transport_recording_and_routing() {
        let table = AliasTable::with_defaults();
        assert_eq!(table.resolve("any", "play"), Some("jack_transport_start"));
        assert_eq!(table.resolve("any", "stop"), Some("jack_transport_stop"));
        assert_eq!(table.resolve("any", "record"), Some("record_start"));
        assert_eq!(table.resolve("any", "connect"), Some("connect_jack_ports"));
        assert_eq!(
            table.resolve("any", "disconnect"),
            Some("disconnect_jack_ports")
        );
    }

    #[test]
    fn phrases_are_normalized_on_insert() {
        let mut table = AliasTable::new();
        table.insert_global("  New   Project! ", "create_project");
        assert_eq!(table.resolve("n", "new project"), Some("create_project"));
    }
}

//! Wake-word gate
//!
//! Watches recognizer text for configured wake phrases and opens a short
//! listening window for the matched node. The window is single-shot: it
//! closes on the first command emission or on timeout, and no new wake can
//! trigger while it is open.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::aliases::normalize;

/// Default listening window after a wake phrase
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// An open listening window
#[derive(Debug, Clone)]
pub struct ListeningWindow {
    /// Node the wake phrase belongs to
    pub node_id: String,
    /// Normalized wake phrase that opened the window
    pub phrase: String,
    deadline: Instant,
}

impl ListeningWindow {
    /// Whether the window has passed its deadline at `now`
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Per-node wake phrase matcher with a single listening window
#[derive(Debug)]
pub struct WakeGate {
    /// node id -> normalized wake phrase
    phrases: HashMap<String, String>,
    window_duration: Duration,
    window: Option<ListeningWindow>,
}

impl WakeGate {
    /// Create a gate from node-to-phrase bindings
    #[must_use]
    pub fn new(wake_words: &HashMap<String, String>, window_duration: Duration) -> Self {
        let phrases = wake_words
            .iter()
            .map(|(node, phrase)| (node.clone(), normalize(phrase)))
            .collect();
        Self {
            phrases,
            window_duration,
            window: None,
        }
    }

    /// Add or replace the wake phrase for a node
    pub fn bind(&mut self, node_id: &str, phrase: &str) {
        self.phrases.insert(node_id.to_string(), normalize(phrase));
    }

    /// Remove a node's wake phrase
    pub fn unbind(&mut self, node_id: &str) {
        self.phrases.remove(node_id);
    }

    /// The currently open window, if any
    #[must_use]
    pub const fn window(&self) -> Option<&ListeningWindow> {
        self.window.as_ref()
    }

    /// Observe recognizer text (partial or final). If the gate is closed and
    /// the normalized text contains a configured phrase, a window opens and
    /// the matched node id is returned.
    pub fn observe(&mut self, text: &str, now: Instant) -> Option<String> {
        if self.window.is_some() {
            return None;
        }
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }

        // Prefer the longest matching phrase so "computer indigo" beats
        // a bare "computer" binding.
        let hit = self
            .phrases
            .iter()
            .filter(|(_, phrase)| !phrase.is_empty() && normalized.contains(phrase.as_str()))
            .max_by_key(|(_, phrase)| phrase.len())
            .map(|(node, phrase)| (node.clone(), phrase.clone()));

        let (node_id, phrase) = hit?;
        tracing::info!(node_id = %node_id, phrase = %phrase, "wake phrase detected");
        self.window = Some(ListeningWindow {
            node_id: node_id.clone(),
            phrase,
            deadline: now + self.window_duration,
        });
        Some(node_id)
    }

    /// Advance time; returns the node id of a window that just timed out
    pub fn tick(&mut self, now: Instant) -> Option<String> {
        if self.window.as_ref().is_some_and(|w| w.expired(now)) {
            let window = self.window.take().expect("checked window");
            tracing::debug!(node_id = %window.node_id, "listening window timed out");
            return Some(window.node_id);
        }
        None
    }

    /// Close the window after a successful command emission
    pub fn close(&mut self) {
        self.window = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> WakeGate {
        let mut words = HashMap::new();
        words.insert("indigo".to_string(), "computer indigo".to_string());
        words.insert("karate".to_string(), "computer karate".to_string());
        WakeGate::new(&words, Duration::from_secs(5))
    }

    #[test]
    fn phrase_match_opens_window_for_node() {
        let mut gate = gate();
        let now = Instant::now();

        assert_eq!(gate.observe("hello there", now), None);
        assert!(gate.window().is_none());

        let woken = gate.observe("Computer Indigo, play", now);
        assert_eq!(woken.as_deref(), Some("indigo"));
        assert_eq!(gate.window().unwrap().node_id, "indigo");
    }

    #[test]
    fn open_window_blocks_further_wakes() {
        let mut gate = gate();
        let now = Instant::now();

        assert!(gate.observe("computer indigo", now).is_some());
        assert_eq!(gate.observe("computer karate", now), None);
        assert_eq!(gate.window().unwrap().node_id, "indigo");
    }

    #[test]
    fn window_times_out() {
        let mut gate = gate();
        let now = Instant::now();

        gate.observe("computer indigo", now);
        assert_eq!(gate.tick(now + Duration::from_secs(1)), None);

        let timed_out = gate.tick(now + Duration::from_secs(6));
        assert_eq!(timed_out.as_deref(), Some("indigo"));
        assert!(gate.window().is_none());

        // A new wake can trigger after the timeout
        assert!(gate.observe("computer karate", now).is_some());
    }

    #[test]
    fn close_ends_the_window() {
        let mut gate = gate();
        let now = Instant::now();
        gate.observe("computer indigo", now);
        gate.close();
        assert!(gate.window().is_none());
        assert_eq!(gate.tick(now + Duration::from_secs(10)), None);
    }

    #[test]
    fn longest_phrase_wins_on_overlap() {
        let mut words = HashMap::new();
        words.insert("short".to_string(), "computer".to_string());
        words.insert("long".to_string(), "computer indigo".to_string());
        let mut gate = WakeGate::new(&words, Duration::from_secs(5));

        let woken = gate.observe("computer indigo play", Instant::now());
        assert_eq!(woken.as_deref(), Some("long"));
    }
}

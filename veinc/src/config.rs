//! Analysis configuration.
//!
//! ```rust,ignore
//! use veinc::config::AnalysisConfig;
//!
//! let config = AnalysisConfig::default()
//!     .with_arena_opt_in(true)
//!     .with_backedge_word("sibling");
//! ```

use crate::escape::EscapeState;

/// Field-name words treated as back-edge hints.
pub const DEFAULT_BACKEDGE_WORDS: &[&str] =
    &["parent", "prev", "previous", "owner", "enclosing", "back", "up"];

/// Options for the memory planner and its passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Whole words that mark a cycle-closing field as weak.
    pub backedge_words: Vec<String>,

    /// Mark cycle-closing fields found by DFS as weak.
    /// Default: true.
    pub structural_back_edges: bool,

    /// Allow arena allocation for sites that qualify.
    /// Default: false.
    pub arena_opt_in: bool,

    /// Escape state assumed for arguments of callees without a summary.
    /// Default: ArgEscape.
    pub unknown_callee_escape: EscapeState,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            backedge_words: DEFAULT_BACKEDGE_WORDS.iter().map(|w| w.to_string()).collect(),
            structural_back_edges: true,
            arena_opt_in: false,
            unknown_callee_escape: EscapeState::ArgEscape,
        }
    }
}

impl AnalysisConfig {
    /// Add a back-edge hint word.
    pub fn with_backedge_word(mut self, word: impl Into<String>) -> Self {
        let word = word.into().to_lowercase();
        if !self.backedge_words.contains(&word) {
            self.backedge_words.push(word);
        }
        self
    }

    /// Replace the back-edge hint words.
    pub fn with_backedge_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backedge_words = words.into_iter().map(|w| w.into().to_lowercase()).collect();
        self
    }

    /// Enable or disable structural back-edge detection.
    pub fn with_structural_back_edges(mut self, enabled: bool) -> Self {
        self.structural_back_edges = enabled;
        self
    }

    /// Enable or disable arena allocation.
    pub fn with_arena_opt_in(mut self, enabled: bool) -> Self {
        self.arena_opt_in = enabled;
        self
    }

    /// Set the escape state assumed for unknown callees.
    pub fn with_unknown_callee_escape(mut self, state: EscapeState) -> Self {
        self.unknown_callee_escape = state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert!(config.backedge_words.iter().any(|w| w == "parent"));
        assert!(config.structural_back_edges);
        assert!(!config.arena_opt_in);
        assert_eq!(config.unknown_callee_escape, EscapeState::ArgEscape);
    }

    #[test]
    fn test_with_backedge_word_deduplicates() {
        let config = AnalysisConfig::default()
            .with_backedge_word("Parent")
            .with_backedge_word("sibling");
        assert_eq!(config.backedge_words.iter().filter(|w| *w == "parent").count(), 1);
        assert!(config.backedge_words.iter().any(|w| w == "sibling"));
    }

    #[test]
    fn test_with_backedge_words_replaces() {
        let config = AnalysisConfig::default().with_backedge_words(["Up"]);
        assert_eq!(config.backedge_words, vec!["up".to_string()]);
    }
}

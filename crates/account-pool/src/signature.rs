//! Exhaustion signature detection for client log lines
//!
//! The CLI client prints a fixed notice when its balance runs out. Only that
//! notice triggers a failover; ordinary rate-limit chatter in the log does not.

/// Notice printed by the CLI client when the active account has no balance left.
pub const DEFAULT_EXHAUSTION_PATTERNS: &[&str] = &["Ready for more? Reload your tokens"];

/// Case-insensitive substring matcher for exhaustion notices.
#[derive(Debug, Clone)]
pub struct Signature {
    patterns: Vec<String>,
}

impl Signature {
    /// Build a signature from one or more substrings. Empty patterns are dropped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    /// Whether any pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Check a single log line for an exhaustion notice.
    pub fn matches(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::new(DEFAULT_EXHAUSTION_PATTERNS)
    }
}

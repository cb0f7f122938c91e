//! Text matching used by rule conditions.
//!
//! Rule patterns are case-insensitive regular expressions. A pattern that
//! does not compile (for instance one stored before validation existed)
//! falls back to a case-insensitive substring test so a single bad rule
//! never disables matching.

use regex::{Regex, RegexBuilder};

/// Capability to test free text against a user-authored pattern.
pub trait PatternMatcher: Send + Sync {
    fn is_match(&self, text: &str) -> bool;
}

#[derive(Debug, Clone)]
pub enum TextPattern {
    Regex(Regex),
    Literal(String),
}

impl TextPattern {
    /// Compile leniently, falling back to a literal on a bad expression.
    pub fn compile(pattern: &str) -> Self {
        match Self::compile_strict(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Rule pattern is not a valid regex, using substring match");
                Self::Literal(pattern.to_lowercase())
            }
        }
    }

    /// Compile or return the regex error; used to validate user input.
    pub fn compile_strict(pattern: &str) -> Result<Self, regex::Error> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(1 << 20)
            .build()
            .map(Self::Regex)
    }
}

impl PatternMatcher for TextPattern {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Literal(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }
}

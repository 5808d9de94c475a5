//! Key patterns for bulk invalidation

use regex::Regex;

use crate::errors::{CacheError, CacheResult};

/// Pattern matched against whole cache keys
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Exact key
    Exact(String),

    /// Every key starting with the prefix
    Prefix(String),

    /// Compiled regular expression (unanchored unless the expression anchors itself)
    Regex(Regex),
}

impl KeyPattern {
    /// Match one exact key
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// Match every key with the given prefix
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Compile a regular expression
    pub fn regex(expression: &str) -> CacheResult<Self> {
        Regex::new(expression)
            .map(Self::Regex)
            .map_err(|err| CacheError::InvalidPattern {
                pattern: expression.to_string(),
                reason: err.to_string(),
            })
    }

    /// Compile a glob where `*` matches any run of characters and `?` exactly one
    ///
    /// Globs are anchored at both ends; every other character matches itself.
    pub fn glob(glob: &str) -> CacheResult<Self> {
        let mut expression = String::with_capacity(glob.len() + 8);
        expression.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => expression.push_str(".*"),
                '?' => expression.push('.'),
                other => expression.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        expression.push('$');

        Regex::new(&expression)
            .map(Self::Regex)
            .map_err(|err| CacheError::InvalidPattern {
                pattern: glob.to_string(),
                reason: err.to_string(),
            })
    }

    /// Check whether `key` matches
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(expected) => key == expected,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(key),
        }
    }
}

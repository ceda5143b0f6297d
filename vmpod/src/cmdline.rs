//! Guest kernel command-line construction.
//!
//! Parameters are ordered key/value pairs. The guest kernel honors the last
//! occurrence of a key, so merging appends and never deduplicates: driver
//! defaults first, debug additions next, caller overrides last.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single kernel boot parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// Ordered kernel command line builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelCmdline {
    params: Vec<Param>,
}

impl KernelCmdline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single parameter, preserving insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params.push(Param::new(key, value));
        self
    }

    /// Append a batch of parameters after the existing ones.
    pub fn extend(&mut self, params: impl IntoIterator<Item = Param>) -> &mut Self {
        self.params.extend(params);
        self
    }

    /// Parse `key=value` words from a raw string (annotation input).
    /// A bare word becomes a key with an empty value.
    pub fn extend_from_str(&mut self, raw: &str) -> &mut Self {
        for word in raw.split_whitespace() {
            match word.split_once('=') {
                Some((k, v)) => self.push(k, v),
                None => self.push(word, ""),
            };
        }
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Render the whitespace-separated command line.
    pub fn render(&self) -> String {
        self.params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for KernelCmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_key_renders_without_equals() {
        let mut c = KernelCmdline::new();
        c.push("quiet", "").push("panic", "1");
        assert_eq!(c.render(), "quiet panic=1");
    }

    #[test]
    fn merge_order_is_preserved_and_never_deduplicated() {
        let mut c = KernelCmdline::new();
        // driver defaults
        c.push("console", "hvc0").push("root", "/dev/pmem0");
        // debug additions
        c.push("earlyprintk", "hvc0");
        // caller overrides shadow at the guest kernel level
        c.push("console", "ttyS0");

        assert_eq!(
            c.render(),
            "console=hvc0 root=/dev/pmem0 earlyprintk=hvc0 console=ttyS0"
        );
        assert_eq!(c.params().len(), 4);
    }

    #[test]
    fn extend_from_str_splits_words() {
        let mut c = KernelCmdline::new();
        c.extend_from_str("agent.log=debug rw  nomodeset");
        assert_eq!(c.render(), "agent.log=debug rw nomodeset");
    }
}

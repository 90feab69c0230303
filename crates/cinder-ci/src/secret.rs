//! Redacting wrapper for credentials.
//!
//! A `Secret` never prints its value through `Debug` or `Display`, and does
//! not implement `Serialize`, so it cannot leak into logs or the run ledger.

use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Read a secret from the named environment variable at the moment of use.
    ///
    /// Unset and empty variables both yield `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        Self::from_lookup(var, |k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup(var: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        lookup(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Secret)
    }

    /// The raw value. Only call this where the value leaves the process.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

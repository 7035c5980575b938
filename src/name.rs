//! Normalized service names.

use std::{fmt, str::FromStr, sync::Arc};

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Errors produced when parsing a [`ServiceName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The name was empty (or only a root dot).
    #[error("service name is empty")]
    Empty,
    /// The name contained whitespace or a control character.
    #[error("service name contains invalid character {0:?}")]
    InvalidCharacter(char),
    /// Two consecutive dots, or a leading dot.
    #[error("service name contains an empty label")]
    EmptyLabel,
    /// A label was longer than 63 bytes.
    #[error("service name label is {0} bytes long (max 63)")]
    LabelTooLong(usize),
    /// The whole name was longer than 253 bytes.
    #[error("service name is {0} bytes long (max 253)")]
    TooLong(usize),
}

/// A fully-qualified DNS name in canonical form: lowercase, with a trailing dot.
///
/// `_http._tcp.Example.com` and `_http._tcp.example.com.` parse to the same
/// name, so they share cache entries and in-flight lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(Arc<str>);

impl ServiceName {
    /// Parses and normalizes a service name.
    pub fn new(name: &str) -> Result<Self, NameError> {
        let trimmed = name.trim();
        let body = trimmed.strip_suffix('.').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(NameError::Empty);
        }
        if let Some(c) = body
            .chars()
            .find(|c| c.is_whitespace() || c.is_control())
        {
            return Err(NameError::InvalidCharacter(c));
        }
        if body.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(body.len()));
        }
        for label in body.split('.') {
            if label.is_empty() {
                return Err(NameError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(NameError::LabelTooLong(label.len()));
            }
        }

        let mut canonical = body.to_ascii_lowercase();
        canonical.push('.');
        Ok(Self(canonical.into()))
    }

    /// The canonical form, including the trailing dot.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ServiceName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

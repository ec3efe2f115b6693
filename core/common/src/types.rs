//! Value types shared between the sync engine and cloud providers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single key/value tag attached to a cloud resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Find the value stored under `key` in a tag list.
    pub fn find<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
        tags.iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

/// A catalog filter of the form `field=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    /// Create a new filter.
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Parse a `field=value` literal.
    ///
    /// The literal is split on every `=` with trailing empty parts dropped;
    /// anything other than exactly two parts is rejected, so `a=1=2`, `a=`
    /// and `bad` all fail.
    ///
    /// # Errors
    /// - Returns `InvalidInput` naming the literal if it is malformed
    pub fn parse(literal: &str) -> crate::Result<Self> {
        let mut parts: Vec<&str> = literal.split('=').collect();
        while parts.last().is_some_and(|part| part.is_empty()) {
            parts.pop();
        }
        match parts.as_slice() {
            [field, value] => Ok(Self::new(*field, *value)),
            _ => Err(crate::Error::InvalidInput(format!(
                "'{}' must be of the form filter-field=filter-value",
                literal
            ))),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}

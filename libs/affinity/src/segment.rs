//! Validated path segments.
//!
//! Owner emails and cluster names end up as directory names under the
//! artifact root. A [`SafeSegment`] can only be constructed from a string that
//! cannot escape its parent directory, so joins built from segments always
//! stay below the root.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted segment, in bytes (common filesystem name limit).
pub const MAX_SEGMENT_LEN: usize = 255;

/// Rejected path segment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("path segment cannot be empty")]
    Empty,

    #[error("path segment exceeds 255 bytes")]
    TooLong,

    #[error("path segment {0:?} contains '..'")]
    Traversal(String),

    #[error("path segment {0:?} contains a path separator")]
    Separator(String),

    #[error("path segment {0:?} contains a control character")]
    Control(String),

    #[error("path segment {0:?} is reserved")]
    Reserved(String),
}

/// A single directory name that is safe to join onto a trusted base path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SafeSegment(String);

impl SafeSegment {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();

        if value.is_empty() {
            return Err(KeyError::Empty);
        }
        if value.len() > MAX_SEGMENT_LEN {
            return Err(KeyError::TooLong);
        }
        if value == "." {
            return Err(KeyError::Reserved(value));
        }
        if value.contains("..") {
            return Err(KeyError::Traversal(value));
        }
        if value.contains(['/', '\\']) {
            return Err(KeyError::Separator(value));
        }
        if value.chars().any(char::is_control) {
            return Err(KeyError::Control(value));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SafeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SafeSegment {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SafeSegment {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SafeSegment> for String {
    fn from(segment: SafeSegment) -> Self {
        segment.0
    }
}

impl AsRef<str> for SafeSegment {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for SafeSegment {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time, so an instance is
//! valid by construction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Validated handler name.
///
/// Doubles as the handler's image identifier, so the charset admits the
/// registry separators `/`, `:` and `.` on top of the usual identifier
/// characters. Must be non-empty, max 128 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerName(String);

impl HandlerName {
    /// Create a new HandlerName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "handler_name",
                value: name,
                reason: "handler name cannot be empty".to_string(),
            });
        }

        if name.len() > 128 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "handler_name",
                value: name.clone(),
                reason: format!("handler name too long: {} chars (max 128)", name.len()),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "handler_name",
                value: name,
                reason: "handler name must contain only alphanumeric characters, '-', '_', '.', '/' and ':'".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for HandlerName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<HandlerName> for String {
    fn from(name: HandlerName) -> Self {
        name.0
    }
}

/// Validated package name.
///
/// Lowercased at construction; the package-size catalog and the fork-server
/// package sets are keyed by lowercased names, and this type makes that hold
/// everywhere by construction. Must be non-empty, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Create a new PackageName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "package_name",
                value: name,
                reason: "package name cannot be empty".to_string(),
            });
        }

        if name.len() > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "package_name",
                value: name.clone(),
                reason: format!("package name too long: {} chars (max 64)", name.len()),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "package_name",
                value: name,
                reason: "package name must contain only ASCII alphanumeric characters, '-', '_' and '.'".to_string(),
            });
        }

        Ok(Self(name.to_ascii_lowercase()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PackageName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

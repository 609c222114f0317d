//! Custom error types for the parsing of Tor documents

use std::fmt;
use std::string::ToString;

use thiserror;

use crate::meta::Fingerprint;

/// Error that occured when parsing or validating a network-status document
#[derive(thiserror::Error, Debug)]
pub enum DocumentParseError {
    /// A line could not be split into a keyword and its arguments at all.
    /// This is always fatal, independent of the validation setting.
    #[error("Malformed line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
    /// A single field did not match its expected encoding
    #[error("Could not decode {field}: {reason}")]
    FieldDecode { field: String, reason: String },
    /// A structural or semantic rule of the document grammar was violated
    #[error("Invalid {entry}: {reason}")]
    Validation { entry: String, reason: String },
    /// A signature failed to verify while all signatures were required to
    #[error("Signature of authority {authority} did not verify: {reason}")]
    SignatureValidation {
        authority: Fingerprint,
        reason: String,
    },
    #[error("Only {valid} valid authority signatures, but {required} are required")]
    InsufficientSignatures {
        valid: usize,
        required: usize,
        failures: Vec<SignatureFailure>,
    },
    #[error("I/O error while reading the document")]
    Io(#[from] std::io::Error),
}

impl DocumentParseError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> DocumentParseError {
        DocumentParseError::MalformedLine {
            line,
            reason: reason.into(),
        }
    }

    /// Create a new Validation error, easily
    pub fn invalid(entry: impl Into<String>, reason: impl Into<String>) -> DocumentParseError {
        DocumentParseError::Validation {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Create a new FieldDecode error for an item whose arguments ran out
    pub fn args_missing(keyword: impl fmt::Display) -> DocumentParseError {
        DocumentParseError::FieldDecode {
            field: format!("'{keyword}' line"),
            reason: "no or not enough arguments".to_string(),
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for DocumentParseError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        DocumentParseError::invalid(
            "directory-signature",
            format!("field '{}' is missing", err.field_name()),
        )
    }
}

/// Why a single authority signature was not counted as valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureFailure {
    pub authority: Fingerprint,
    pub reason: String,
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.authority, self.reason)
    }
}

pub(crate) trait ErrorContext<T> {
    type IntoError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError>;
}

impl<T, E: fmt::Display> ErrorContext<T> for Result<T, E> {
    type IntoError = DocumentParseError;

    fn context(self, context: impl ToString) -> Result<T, Self::IntoError> {
        self.map_err(|err| DocumentParseError::FieldDecode {
            field: context.to_string(),
            reason: err.to_string(),
        })
    }
}

use thiserror::Error;

use crate::auth::AuthChallenge;

/// Classified failures raised by the store, the fetcher and the importer.
///
/// Each variant maps to an exception tag that travels with a remote call
/// failure, so clients can branch on the kind without parsing messages.
#[derive(Error, Debug, Clone)]
pub enum MigrateError {
    /// The remote API answered 401 with a challenge the client must satisfy.
    #[error("{}", .0.raw)]
    AuthRequired(AuthChallenge),

    #[error("{0}")]
    Permission(String),

    #[error("{0}")]
    Validation(String),

    #[error("{doctype} {name} already exists")]
    DuplicateEntry { doctype: String, name: String },

    #[error("{doctype} {name} not found")]
    DoesNotExist { doctype: String, name: String },

    #[error("[{doctype}, {name}]: {}", .fields.join(", "))]
    Mandatory {
        doctype: String,
        name: String,
        fields: Vec<String>,
    },

    #[error("Could not find {field}: {value} ({link_doctype})")]
    LinkValidation {
        field: String,
        value: String,
        link_doctype: String,
    },
}

impl MigrateError {
    /// Exception tag reported to remote callers.
    pub fn exc_type(&self) -> &'static str {
        match self {
            MigrateError::AuthRequired(_) | MigrateError::Permission(_) => "PermissionError",
            MigrateError::Validation(_) => "ValidationError",
            MigrateError::DuplicateEntry { .. } => "DuplicateEntryError",
            MigrateError::DoesNotExist { .. } => "DoesNotExistError",
            MigrateError::Mandatory { .. } => "MandatoryError",
            MigrateError::LinkValidation { .. } => "LinkValidationError",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MigrateError::Validation(msg.into())
    }

    pub fn not_found(doctype: &str, name: &str) -> Self {
        MigrateError::DoesNotExist { doctype: doctype.to_string(), name: name.to_string() }
    }

    /// The structured challenge, when this is an authentication failure.
    pub fn challenge(&self) -> Option<&AuthChallenge> {
        match self {
            MigrateError::AuthRequired(c) => Some(c),
            _ => None,
        }
    }
}

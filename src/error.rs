use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Message shown to end users in place of system-level failures.
pub const SYSTEM_ERROR_MESSAGE: &str =
    "A system-level problem occurred. Please contact support and check the logs.";

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, such as a duplicate name or a malformed tenant name.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A referenced tenant, sharding entry, role or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The operation is blocked by existing references.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The sharding cache and its durable backup disagree.
    ///
    /// Raised at startup and never repaired automatically.
    #[error("sharding consistency error: {0}")]
    Consistency(String),
    /// A transaction or database failure that an operator must look at.
    #[error("system error: {0}")]
    System(String),
    /// No database can accept the new tenant.
    #[error("no database available: {0}")]
    NoCapacity(String),
    /// The operation exceeded its deadline and was rolled back.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission input.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
}

impl Error {
    /// Returns the message suitable for an admin UI.
    ///
    /// System, store and timeout failures are replaced by
    /// [`SYSTEM_ERROR_MESSAGE`]; the original error stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::NoCapacity(msg)
            | Self::InvalidId(msg)
            | Self::InvalidPermission(msg) => msg.clone(),
            Self::Consistency(_) | Self::System(_) | Self::Timeout(_) | Self::Store(_) => {
                tracing::error!(error = %self, "system-level failure");
                SYSTEM_ERROR_MESSAGE.to_string()
            }
        }
    }

    /// Returns true for errors caused by the caller's input.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::NoCapacity(_)
                | Self::InvalidId(_)
                | Self::InvalidPermission(_)
        )
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_should_hide_system_details() {
        let err = Error::System("deadlock on table Invoices".to_string());
        assert_eq!(err.user_message(), SYSTEM_ERROR_MESSAGE);
        assert!(!err.is_user_error());
    }

    #[test]
    fn user_message_should_keep_validation_text() {
        let err = Error::Validation("name already used".to_string());
        assert_eq!(err.user_message(), "name already used");
        assert!(err.is_user_error());
    }
}

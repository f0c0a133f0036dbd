//! Error types for a3s-guard

use thiserror::Error;

/// Errors that can occur while running a critical operation
///
/// The first three variants are raised before any transaction is opened.
/// `Execution`, `Integrity` and `BusinessRule` are raised after the
/// transaction is active and always cause a rollback.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Operation payload failed structural/data validation
    #[error("Validation failed for operation '{operation_type}': {reason}")]
    Validation {
        operation_type: String,
        reason: String,
    },

    /// Actor lacks one or more required permissions
    #[error("Access denied for operation '{operation_type}': missing permissions {missing:?}")]
    AccessDenied {
        operation_type: String,
        missing: Vec<String>,
    },

    /// A rate or context-specific security rule rejected the operation
    #[error("Security constraint '{constraint}' violated: {reason}")]
    SecurityConstraint { constraint: String, reason: String },

    /// Business logic of the operation failed
    #[error("Execution of operation '{operation_type}' failed: {reason}")]
    Execution {
        operation_type: String,
        reason: String,
        #[source]
        source: Option<Box<GuardError>>,
    },

    /// Result failed structural integrity verification
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Result violates a business rule
    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    /// Commit or rollback mechanics failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Audit sink could not persist an event
    ///
    /// Never surfaced to a pipeline caller; only reported to the fallback channel.
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Repository or store port failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl GuardError {
    /// Stable classification tag, written into FAILURE audit details
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::AccessDenied { .. } => "access_denied",
            Self::SecurityConstraint { .. } => "security_constraint",
            Self::Execution { .. } => "operation_execution",
            Self::Integrity(_) => "integrity",
            Self::BusinessRule(_) => "business_rule",
            Self::Transaction(_) => "transaction",
            Self::AuditWrite(_) => "audit_write",
            Self::Storage(_) => "storage",
            Self::NotFound(_) => "not_found",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Errors raised by the security gate, before a transaction exists
    pub fn is_pre_transaction(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::AccessDenied { .. } | Self::SecurityConstraint { .. }
        )
    }

    /// Errors that require the active transaction to be rolled back
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. } | Self::Integrity(_) | Self::BusinessRule(_)
        )
    }

    /// Wrap an arbitrary failure from business logic as an execution error
    pub fn execution(operation_type: impl Into<String>, cause: GuardError) -> Self {
        Self::Execution {
            operation_type: operation_type.into(),
            reason: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }
}

/// Result type alias for guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_classification() {
        let denied = GuardError::AccessDenied {
            operation_type: "content.create".to_string(),
            missing: vec!["content.create".to_string()],
        };
        assert_eq!(denied.kind(), "access_denied");
        assert!(denied.is_pre_transaction());
        assert!(!denied.triggers_rollback());

        let integrity = GuardError::Integrity("bad token".to_string());
        assert!(!integrity.is_pre_transaction());
        assert!(integrity.triggers_rollback());

        let tx = GuardError::Transaction("commit failed".to_string());
        assert!(!tx.is_pre_transaction());
        assert!(!tx.triggers_rollback());
    }

    #[test]
    fn test_execution_keeps_cause() {
        let err = GuardError::execution("content.update", GuardError::Storage("disk full".into()));
        assert_eq!(err.kind(), "operation_execution");
        assert!(err.to_string().contains("disk full"));

        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Storage error: disk full");
    }
}

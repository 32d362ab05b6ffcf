//! Domain model error types.

use thiserror::Error;

/// Errors raised while validating metaverse configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetaverseError {
    /// A flow rule targets an attribute the schema does not define.
    #[error("Sync rule '{rule}' targets unknown attribute {attribute}")]
    MissingTargetAttribute { rule: String, attribute: String },

    /// A rule references an attribute the schema does not define.
    #[error("Sync rule '{rule}' references unknown attribute {attribute}")]
    UnknownAttribute { rule: String, attribute: String },

    /// A rule was validated against the wrong object type.
    #[error("Sync rule '{rule}' expects object type {expected}, got {actual}")]
    ObjectTypeMismatch {
        rule: String,
        expected: String,
        actual: String,
    },
}

impl MetaverseError {
    /// Name of the offending sync rule.
    #[must_use]
    pub fn rule(&self) -> &str {
        match self {
            MetaverseError::MissingTargetAttribute { rule, .. }
            | MetaverseError::UnknownAttribute { rule, .. }
            | MetaverseError::ObjectTypeMismatch { rule, .. } => rule,
        }
    }
}

/// Result type for domain model operations.
pub type MetaverseResult<T> = Result<T, MetaverseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MetaverseError::MissingTargetAttribute {
            rule: "HR inbound".to_string(),
            attribute: "EmployeeId".to_string(),
        };
        assert!(err.to_string().contains("HR inbound"));
        assert!(err.to_string().contains("EmployeeId"));
        assert_eq!(err.rule(), "HR inbound");
    }
}

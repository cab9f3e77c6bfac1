use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes the pipeline distinguishes when deciding whether a record,
/// a batch, or a whole unit is affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried with backoff; recorded per record, the unit is not failed.
    TransientNetwork,
    /// Record skipped and logged as an incident; the unit continues.
    Validation,
    /// Unresolved catalog reference; loaded as null and logged, not fatal.
    ReferentialGap,
    /// Rolled back at record or batch granularity; the unit ends in `error`.
    Persistence,
    /// Missing ledger or input artifact; the unit aborts with no effect.
    FatalConfig,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::Validation => "validation",
            ErrorClass::ReferentialGap => "referential_gap",
            ErrorClass::Persistence => "persistence",
            ErrorClass::FatalConfig => "fatal_config",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("validation error on record {record}: {reason}")]
    Validation { record: String, reason: String },

    #[error("unresolved {kind} reference: {value}")]
    ReferentialGap { kind: String, value: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn validation(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            record: record.into(),
            reason: reason.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalConfig(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::TransientNetwork(_) => ErrorClass::TransientNetwork,
            PipelineError::Validation { .. } | PipelineError::Serialize(_) => ErrorClass::Validation,
            PipelineError::ReferentialGap { .. } => ErrorClass::ReferentialGap,
            PipelineError::Persistence(_) | PipelineError::Io(_) => ErrorClass::Persistence,
            PipelineError::FatalConfig(_) => ErrorClass::FatalConfig,
        }
    }

    /// Whether the error aborts the whole unit rather than one record.
    pub fn is_unit_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::FatalConfig | ErrorClass::Persistence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            PipelineError::TransientNetwork("timeout".into()).class(),
            ErrorClass::TransientNetwork
        );
        assert_eq!(PipelineError::validation("42", "bad date").class(), ErrorClass::Validation);
        assert_eq!(PipelineError::fatal("no artifact").class(), ErrorClass::FatalConfig);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(PipelineError::from(io).class(), ErrorClass::Persistence);
    }

    #[test]
    fn test_unit_fatal_only_for_config_and_persistence() {
        assert!(PipelineError::fatal("missing").is_unit_fatal());
        assert!(PipelineError::Persistence("tx aborted".into()).is_unit_fatal());
        assert!(!PipelineError::TransientNetwork("reset".into()).is_unit_fatal());
        assert!(!PipelineError::ReferentialGap {
            kind: "fund".into(),
            value: "x".into()
        }
        .is_unit_fatal());
    }

    #[test]
    fn test_validation_message_names_record() {
        let err = PipelineError::validation("A-17", "missing awardDate");
        let msg = err.to_string();
        assert!(msg.contains("A-17"));
        assert!(msg.contains("missing awardDate"));
    }

    #[test]
    fn test_error_class_serde() {
        let json = serde_json::to_string(&ErrorClass::ReferentialGap).unwrap();
        assert_eq!(json, r#""referential_gap""#);
        assert_eq!(ErrorClass::FatalConfig.to_string(), "fatal_config");
    }
}

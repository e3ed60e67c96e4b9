//! Error types surfaced by a supervised unit.
//!
//! `ModuleError` is the only failure that ever crosses the module handle or an
//! invocation; everything else is logged and turned into a supervisor event.

/// Failures observed through `Unit::module()` or `ModuleFn::call()`
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Unit was killed before it ever became accessible
    #[error("Module unavailable")]
    Unavailable,

    #[error("Cannot execute killed module")]
    ExecutionOnKilledModule,

    /// The live module is no longer a function
    #[error("Cannot execute module of {actual} type")]
    TypeMismatch { actual: String },

    #[error("Module exited unexpectedly")]
    UnexpectedExit,

    /// A reload turned a function module into a value while calls were queued
    #[error("Module is not a function. Cannot execute.")]
    BufferedInvocationDiscarded,

    /// The worker handling this call was stopped for a restart
    #[error("Module restarted before the invocation completed")]
    Restarted,

    /// Error reported by the worker for this particular call
    #[error("{0}")]
    Invocation(String),
}

impl ModuleError {
    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable => "MODULE_UNAVAILABLE",
            Self::ExecutionOnKilledModule => "EXECUTION_ON_KILLED_MODULE",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::UnexpectedExit => "UNEXPECTED_EXIT",
            Self::BufferedInvocationDiscarded => "BUFFERED_INVOCATION_DISCARDED",
            Self::Restarted => "RESTARTED",
            Self::Invocation(_) => "INVOCATION_FAILED",
        }
    }
}

/// Launch-time failures
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid watch pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_names_actual_type() {
        let err = ModuleError::TypeMismatch { actual: "number".into() };
        assert_eq!(err.to_string(), "Cannot execute module of number type");
        assert_eq!(err.error_code(), "TYPE_MISMATCH");
    }

    #[test]
    fn test_invocation_error_carries_worker_message() {
        let err = ModuleError::Invocation("division by zero".into());
        assert_eq!(err.to_string(), "division by zero");
    }
}

//! Error types.
//!
//! Grounded on `atlas-runtime::error`'s runtime error type, derived with
//! `thiserror` rather than a hand-written `Display` impl. One deliberate
//! omission: the base spec never traps division by zero (it produces
//! `inf`/`-inf`/`NaN` like any other IEEE-754 division), so unlike
//! `atlas-runtime::RuntimeError` there is no `DivideByZero` variant here.
//! Compile-time errors are reported as [`crate::diagnostic::Diagnostic`]s
//! directly, not through a parallel error type here.

use thiserror::Error;

/// Errors that can arise while the VM is executing already-compiled
/// bytecode. Every variant carries enough context for the VM's
/// stack-trace printer; the VM attaches the current line itself rather
/// than each variant repeating it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Operand must be a number.")]
    OperandMustBeNumber,

    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,

    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),

    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,

    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),

    #[error("Can only call functions and classes.")]
    NotCallable,

    #[error("Expected {expected} arguments, but got {got}.")]
    ArityMismatch { expected: u8, got: u8 },

    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,

    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,

    #[error("Stack overflow.")]
    StackOverflow,

    #[error("{0}")]
    Native(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_interpolates_variant_fields() {
        let err = RuntimeError::ArityMismatch { expected: 2, got: 1 };
        assert_eq!(err.to_string(), "Expected 2 arguments, but got 1.");
        let err = RuntimeError::UndefinedVariable("x".to_string());
        assert_eq!(err.to_string(), "Undefined variable 'x'.");
    }

    #[test]
    fn invoke_miss_and_property_miss_share_the_same_message_shape() {
        let err = RuntimeError::UndefinedProperty("who".to_string());
        assert_eq!(err.to_string(), "Undefined property 'who'.");
    }
}

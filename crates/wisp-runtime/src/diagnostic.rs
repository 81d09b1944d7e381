//! Diagnostic formatting.
//!
//! A narrowed version of `atlas-runtime::diagnostic`: no error codes, no
//! JSON schema, no related-location graph — the base spec's wire format
//! is exactly `[line L] Error [at <lexeme>|at end]: <message>`, so that's
//! all this carries.

use std::fmt;

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "Error"),
        }
    }
}

/// Where in the token stream an error was reported, for the `at ...`
/// clause. An `Error` token's lexeme is already the message (not a
/// location), so it gets no `at` clause at all, matching the reference
/// behavior of special-casing scanner-error tokens out of the location
/// fragment entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    AtEnd,
    AtLexeme(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub line: u32,
    pub location: ErrorLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, location: ErrorLocation, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            line,
            location,
            message: message.into(),
        }
    }

    fn at_clause(&self) -> String {
        match &self.location {
            ErrorLocation::AtEnd => " at end".to_string(),
            ErrorLocation::AtLexeme(lexeme) => format!(" at '{lexeme}'"),
            ErrorLocation::None => String::new(),
        }
    }

    pub fn to_plain_string(&self) -> String {
        format!(
            "[line {}] {}{}: {}",
            self.line,
            self.level,
            self.at_clause(),
            self.message
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] {}{}: {}",
            self.line,
            self.level.to_string().red().bold(),
            self.at_clause(),
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_at_lexeme() {
        let diag = Diagnostic::error(3, ErrorLocation::AtLexeme("+".to_string()), "Expect expression.");
        assert_eq!(diag.to_plain_string(), "[line 3] Error at '+': Expect expression.");
    }

    #[test]
    fn formats_at_end() {
        let diag = Diagnostic::error(7, ErrorLocation::AtEnd, "Expect ';' after value.");
        assert_eq!(diag.to_plain_string(), "[line 7] Error at end: Expect ';' after value.");
    }
}

//! Result type definition and extension traits.
//!
//! Provides combinators for tolerated failures without unwrap/expect/panic.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for Steward core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing safe combinators for Results.
///
/// Implemented for any `Result` whose error is `Display`, so engine-level
/// errors get the same treatment as core ones.
pub trait ResultExt<T, E> {
    /// Convert a Result to an Option, logging the error at warn level.
    fn into_option_logged(self, context: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_into_option_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.into_option_logged("reading"), Some(42));
    }

    #[test]
    fn test_result_into_option_err() {
        let result: Result<i32> = Err(Error::json_parse_failed("trailing comma"));
        assert_eq!(result.into_option_logged("reading"), None);
    }

    #[test]
    fn test_foreign_error_into_option() {
        let result: std::result::Result<i32, String> = Err("unreachable".to_string());
        assert_eq!(result.into_option_logged("dialing"), None);
    }
}

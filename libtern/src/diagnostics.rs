use crate::error::Error;
use crate::error::Result;
use itertools::Itertools as _;

/// Collects per-relocation errors so that a link reports everything wrong
/// with its inputs instead of stopping at the first bad relocation. Internal
/// inconsistencies don't go through here; they abort immediately.
#[derive(Default)]
pub struct Diagnostics {
    errors: Vec<Error>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Succeeds if nothing was reported, otherwise produces one error
    /// carrying every accumulated diagnostic.
    pub fn into_result(self) -> Result {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(crate::error!(
            "{}",
            self.errors.iter().map(|error| format!("{error:#}")).join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ok() {
        assert!(Diagnostics::new().into_result().is_ok());
    }

    #[test]
    fn test_errors_are_combined() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(crate::error!("first problem"));
        diagnostics.error(crate::error!("second problem"));
        assert_eq!(diagnostics.error_count(), 2);
        let message = diagnostics.into_result().unwrap_err().to_string();
        assert!(message.contains("first problem"));
        assert!(message.contains("second problem"));
    }
}

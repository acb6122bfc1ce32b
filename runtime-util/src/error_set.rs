//! A multi-error accumulator for validation passes that want to report
//! every problem found rather than bailing out on the first one.

use std::fmt;

#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl std::error::Error + Send + Sync + 'static) {
        self.errors.push(Box::new(err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn std::error::Error + Send + Sync)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    /// Consumes the set, returning `Ok(())` if it collected nothing.
    pub fn into_result(self) -> Result<(), ErrorSet> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} error(s): {}", self.errors.len(), joined)
    }
}

impl std::error::Error for ErrorSet {}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("bad thing: {0}")]
    struct Boom(&'static str);

    #[test]
    fn empty_set_is_ok() {
        assert!(ErrorSet::new().into_result().is_ok());
    }

    #[test]
    fn accumulates_and_formats_all_errors() {
        let mut set = ErrorSet::new();
        set.push(Boom("first"));
        set.push(Boom("second"));
        assert_eq!(set.len(), 2);
        let err = set.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }
}

//! Error types for engines-rs.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::EngineState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{name}: cannot {operation} when it is {state}")]
    InvalidState {
        name: String,
        state: EngineState,
        operation: &'static str,
    },

    #[error("{name}: can't execute engine method as it's already executing")]
    AlreadyExecuting { name: String },

    #[error("{name}: {hook} hook failed: {source}")]
    Hook {
        name: String,
        hook: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("{name}: in-flight work did not finish within {timeout:?}")]
    DrainTimeout { name: String, timeout: Duration },

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a hook failure. Errors that are already ours (a nested hook
    /// failure, a drain timeout) pass through unchanged.
    pub(crate) fn hook(name: &str, hook: &'static str, source: anyhow::Error) -> Self {
        match source.downcast::<Error>() {
            Ok(error) => error,
            Err(source) => Self::Hook {
                name: name.to_string(),
                hook,
                source: source.into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A work failure made of several independent causes.
///
/// Returned by work functions that fan out and collect more than one error.
/// Aggregates may nest; [`flatten`] walks them down to the leaf causes.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<anyhow::Error>,
}

impl AggregateError {
    pub fn new(errors: Vec<anyhow::Error>) -> Self {
        Self { errors }
    }

    pub fn push(&mut self, error: impl Into<anyhow::Error>) {
        self.errors.push(error.into());
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_inner(self) -> Vec<anyhow::Error> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            write!(f, "; [{i}] {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl FromIterator<anyhow::Error> for AggregateError {
    fn from_iter<I: IntoIterator<Item = anyhow::Error>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Flatten a work failure into its leaf causes.
///
/// Non-aggregate errors come back as a single-element vec.
pub fn flatten(error: anyhow::Error) -> Vec<anyhow::Error> {
    match error.downcast::<AggregateError>() {
        Ok(aggregate) => aggregate.errors.into_iter().flat_map(flatten).collect(),
        Err(error) => vec![error],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_plain_error_is_single() {
        let flat = flatten(anyhow::anyhow!("boom"));
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].to_string(), "boom");
    }

    #[test]
    fn flatten_nested_aggregates() {
        let inner: AggregateError = vec![anyhow::anyhow!("b"), anyhow::anyhow!("c")]
            .into_iter()
            .collect();
        let outer = AggregateError::new(vec![anyhow::anyhow!("a"), inner.into()]);

        let messages: Vec<String> = flatten(outer.into())
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn invalid_state_message_names_engine_and_state() {
        let err = Error::InvalidState {
            name: "indexer".to_string(),
            state: EngineState::Started,
            operation: "start",
        };
        assert_eq!(err.to_string(), "indexer: cannot start when it is Started");
    }
}

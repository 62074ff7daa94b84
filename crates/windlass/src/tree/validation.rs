//! Validation errors collected during the caching walk

use serde::{Deserialize, Serialize};

use super::ActivityId;

/// A single validation finding
///
/// The walker collects these instead of throwing; each is stamped with a
/// chain-derived prefix and the display name of the offending activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// What went wrong
    pub message: String,

    /// Display name of the offending activity
    pub source_name: Option<String>,

    /// Path from the root to the offending activity, slash-separated
    pub prefix: Option<String>,

    /// Id of the offending activity, when one was assigned
    pub activity: Option<ActivityId>,

    /// Warnings do not fail the walk
    pub is_warning: bool,
}

impl ValidationError {
    /// Create an error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_name: None,
            prefix: None,
            activity: None,
            is_warning: false,
        }
    }

    /// Create a warning
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            is_warning: true,
            ..Self::new(message)
        }
    }

    /// Stamp the offending activity's display name
    pub fn with_source(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    /// Stamp the chain-derived prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Stamp the offending activity id
    pub fn with_activity(mut self, id: ActivityId) -> Self {
        self.activity = Some(id);
        self
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{prefix}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(source) = &self.source_name {
            write!(f, " (in '{source}')")?;
        }
        Ok(())
    }
}

/// The walk failed; every offending node contributed one error
#[derive(Debug, Clone, thiserror::Error)]
pub struct ValidationFailure {
    /// All collected errors, walk order
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} validation error(s)", self.errors.len())?;
        if let Some(first) = self.errors.first() {
            write!(f, ": {first}")?;
        }
        Ok(())
    }
}

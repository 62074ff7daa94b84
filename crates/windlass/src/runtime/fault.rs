//! Runtime faults raised from activity bodies

use serde::{Deserialize, Serialize};

use crate::tree::ActivityId;

use super::instance::InstanceId;

/// Where a fault originated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSource {
    /// Definition id of the faulting activity
    pub activity: ActivityId,

    /// Live invocation that raised the fault
    pub instance: InstanceId,

    /// Display name of the faulting activity
    pub display_name: String,
}

/// A failure raised while executing an activity body
///
/// Anything short of a fatal error becomes one of these and travels the
/// unhandled-exception path to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    /// Failure message
    pub message: String,

    /// Faulting activity, filled in by the scheduler
    pub source: Option<FaultSource>,

    /// Underlying cause chain, outermost first
    pub causes: Vec<String>,
}

impl ActivityFailure {
    /// Create a new failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            causes: vec![],
        }
    }

    /// Append a cause to the chain
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub(crate) fn with_source(mut self, source: FaultSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Whether the given text appears in the message or cause chain
    pub fn mentions(&self, text: &str) -> bool {
        self.message.contains(text) || self.causes.iter().any(|c| c.contains(text))
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} (in '{}')", self.message, source.display_name),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityFailure {}

impl From<anyhow::Error> for ActivityFailure {
    fn from(err: anyhow::Error) -> Self {
        let mut failure = Self::new(err.to_string());
        for cause in err.chain().skip(1) {
            failure.causes.push(cause.to_string());
        }
        failure
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    BeforePipeline,
    BeforeModelCall,
    ModelCall,
    AfterModelCall,
    AfterPipeline,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BeforePipeline => "before_pipeline",
            Hook::BeforeModelCall => "before_model_call",
            Hook::ModelCall => "model_call",
            Hook::AfterModelCall => "after_model_call",
            Hook::AfterPipeline => "after_pipeline",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised by a stage hook or the model call.
///
/// Stages construct the error with a `kind` and message; the executor stamps
/// the stage name, hook and the context's source metadata before returning it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage}' failed ({kind}): {message}")]
pub struct StageError {
    pub stage: String,
    pub hook: Option<Hook>,
    pub kind: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
}

impl StageError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: String::new(),
            hook: None,
            kind: kind.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// The payload could not be interpreted.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new("invalid_payload", message)
    }

    /// A collaborator (store, model endpoint) failed.
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new("dependency", message)
    }

    /// The whole run exceeded its time budget.
    pub fn timeout(after: Duration) -> Self {
        let mut err = Self::new(
            "timeout",
            format!("pipeline did not finish within {}ms", after.as_millis()),
        );
        err.stage = "pipeline".to_string();
        err
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn at(
        mut self,
        stage: &str,
        hook: Hook,
        source_metadata: &BTreeMap<String, String>,
    ) -> Self {
        self.stage = stage.to_string();
        self.hook = Some(hook);
        for (k, v) in source_metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }
}

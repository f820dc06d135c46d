use std::io;

use thiserror::Error;

/// Terminal failure of a single analysis call.
///
/// Every variant is fatal to the call that produced it; there is no retry
/// above the cascade. The presentation layer only distinguishes success from
/// failure-with-reason, so the `Display` output carries the full cause chain.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The local staging store could not be created or written.
    #[error("media staging failed: {0}")]
    Staging(#[from] io::Error),

    /// The remote service rejected ingestion of the staged media.
    #[error("upload rejected: {0:#}")]
    Upload(anyhow::Error),

    /// The remote service marked the uploaded asset unusable, or the poll
    /// deadline expired before it became ready.
    #[error("remote processing of {asset} failed: {reason}")]
    Processing { asset: String, reason: String },

    /// Every candidate model failed; carries the most recent underlying
    /// error for diagnostics.
    #[error("all {attempts} candidate models failed; last error: {last:#}")]
    Exhausted { attempts: usize, last: anyhow::Error },

    /// The final candidate answered, but its payload did not parse as the
    /// expected structured shape. Earlier candidates' parse failures fall
    /// through to the next candidate instead of raising this.
    #[error("model reply was not valid structured output: {0:#}")]
    Malformed(anyhow::Error),

    /// The caller supplied the wrong input shape for the task.
    #[error("invalid input: {0}")]
    Input(String),
}

impl PipelineError {
    /// Short stable tag used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Staging(_) => "staging",
            PipelineError::Upload(_) => "upload",
            PipelineError::Processing { .. } => "processing",
            PipelineError::Exhausted { .. } => "exhausted",
            PipelineError::Malformed(_) => "malformed",
            PipelineError::Input(_) => "input",
        }
    }
}

//! Error taxonomies for composition, transforms, and runners

use thiserror::Error;

use crate::transform::TransformKey;

/// Composition failures. Fatal to the attempted recomposition only:
/// the previously installed snapshot stays authoritative.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompositionError {
    #[error("duplicate kind id: {0}")]
    DuplicateKind(String),

    #[error("compose document names a source that was not provided: {0}")]
    MissingSource(String),

    #[error("unresolved schema reference: {0}")]
    UnresolvedSchema(String),

    #[error("invalid media type pattern: {0}")]
    InvalidMediaType(String),

    #[error("transform operation not resolvable to a runner capability: {0}")]
    UnresolvedTransform(String),

    #[error("extension '{source_id}' may not replace field '{field}' of kind '{kind}' it does not own")]
    NotOwner {
        source_id: String,
        kind: String,
        field: String,
    },

    #[error("override targets unknown kind '{kind}'")]
    UnknownOverrideKind { kind: String },

    #[error("override for kind '{kind}' has invalid field path '{path}': {reason}")]
    InvalidOverridePath {
        kind: String,
        path: String,
        reason: String,
    },
}

/// Errors loading registry source documents from disk. These occur before
/// composition proper and are surfaced by the CLI layer.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("compose document references unknown source id: {0}")]
    UnknownSource(String),
}

/// Runner execution failures. A runner must report one of these rather
/// than a partial or ambiguous success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("transform exceeded its wall-time limit")]
    Timeout,

    #[error("transform output exceeded the size limit ({actual} > {limit} bytes)")]
    TooLarge { limit: u64, actual: u64 },

    #[error("tool failure: {0}")]
    ToolFailure(String),

    #[error("input rejected: {0}")]
    InputRejected(String),
}

impl RunnerError {
    /// Input rejections are deterministic: retrying the same inputs cannot
    /// succeed, so the scheduler terminalizes them without burning retries.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunnerError::InputRejected(_))
    }
}

/// Terminal transform outcomes surfaced to `wait` callers once the retry
/// budget is exhausted or the wait itself gives up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform {key} failed after {attempts} attempt(s): {error}")]
    Terminal {
        key: TransformKey,
        attempts: u32,
        error: RunnerError,
    },

    #[error("timed out waiting for transform {key}")]
    AwaitTimeout { key: TransformKey },

    #[error("transform {key} was cancelled")]
    Cancelled { key: TransformKey },

    #[error("no runner registered for operation '{0}'")]
    UnknownOperation(String),
}

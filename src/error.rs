use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Error raised by a function's metadata call (`requirements`, `results` or
/// `additional_requirements`).
///
/// Resolutions are shared between requirements and between builds, so the
/// underlying error is reference counted to keep it cheap to clone.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct CandidateError(pub(crate) Arc<anyhow::Error>);

impl CandidateError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn message(&self) -> String {
        self.0.to_string()
    }
}

impl From<anyhow::Error> for CandidateError {
    fn from(e: anyhow::Error) -> Self {
        CandidateError(Arc::new(e))
    }
}

/// Malformed input handed to the engine. These are the only failures a build
/// reports by returning `Err`; everything else ends up in the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Calculation configuration name must not be empty")]
    EmptyConfigName,

    #[error("Requirement #{0} has an empty value name")]
    EmptyValueName(usize),

    #[error("Requirement #{0} has an empty target identity")]
    EmptyTargetIdentity(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("Function identifier must not be empty")]
    EmptyFunctionId,

    #[error("Function '{0}' is registered more than once")]
    DuplicateFunction(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("Couldn't compile the function catalogue.\n{0}")]
    Catalogue(#[from] CatalogueError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read view definition.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Malformed view definition in '{path}'.\n{source}")]
    Json {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("View '{0}' is defined more than once")]
    DuplicateView(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode graph snapshot.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode graph snapshot.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't fingerprint graph.\n{0}")]
    Fingerprint(#[from] serde_json::Error),
}

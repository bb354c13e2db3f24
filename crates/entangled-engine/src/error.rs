use relative_path::RelativePathBuf;
use std::path::PathBuf;
use thiserror::Error;

/// The engine's unified error hierarchy. Every fallible core operation
/// returns `Result<T, EngineError>`; the CLI formats these with `Display`
/// and never needs to pattern-match beyond picking an exit code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{path}:{line}: {message}")]
    Parse {
        path: RelativePathBuf,
        line: usize,
        message: String,
    },

    #[error("cyclic reference to `<<{name}>>` while tangling {path}")]
    Cycle { name: String, path: RelativePathBuf },

    #[error("reference to undefined block `<<{name}>>`")]
    UnknownRef { name: String },

    #[error("target `{path}` is claimed by multiple root blocks: {sources:?}")]
    DuplicateTarget {
        path: RelativePathBuf,
        sources: Vec<String>,
    },

    #[error("stitch error in {path}: {message}")]
    Stitch { path: PathBuf, message: String },

    #[error("stitch not supported for annotation=supplemental target `{path}`")]
    SupplementalNotSupported { path: PathBuf },

    #[error("`{path}` was modified externally; rerun with --force to overwrite")]
    Conflict { path: PathBuf },

    #[error("block `{id}` present in document but missing from tangled target")]
    MissingBlock { id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] entangled_config::ConfigError),

    #[error("malformed file database: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern `{pattern}`: {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed YAML in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path:?} did not read back as written")]
    SaveVerification { path: PathBuf },

    #[error("invalid proxy descriptor '{name}': {}", .issues.join(", "))]
    InvalidDescriptor { name: String, issues: Vec<String> },

    #[error("remote subscription {url} unavailable: {reason}")]
    Remote { url: String, reason: String },

    #[error("unsupported proxy type '{0}'")]
    UnsupportedProtocol(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("subscription '{0}' already exists")]
    AlreadyExists(String),

    #[error("sync of '{0}' produced no proxy files, keeping the existing ones")]
    EmptyReplacement(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process is already running")]
    AlreadyRunning,
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, source: serde_yaml::Error) -> Self {
        Error::Parse {
            path: path.into(),
            source,
        }
    }
}

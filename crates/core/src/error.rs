use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("filesystem error at {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("storage error (key={key}): {message}")]
    Storage { key: String, message: String },

    #[error("deploy capability rejected for project {project:?}: {message}")]
    Capability { project: String, message: String },

    #[error("deployment failed: {message}")]
    RemoteDeployFailure { message: String },

    #[error("upload worker failed: {message}")]
    Worker { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

impl Error {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Enumeration and stat failures, whichever layer reported them.
    pub fn is_filesystem(&self) -> bool {
        matches!(
            self,
            Self::Filesystem { .. } | Self::Walkdir(_) | Self::NonUtf8Path { .. }
        )
    }
}

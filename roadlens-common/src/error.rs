#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} was not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    External(String),

    #[error("{0}")]
    Canceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a collaborator failure (subprocess, codec, remote API) whose
    /// own error type lives outside this crate.
    pub fn external(source: impl ToString) -> Self {
        Error::External(source.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

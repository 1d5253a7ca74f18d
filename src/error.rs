use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the core distinguishes: validation, filesystem, network-setup,
/// vmm, http, state, and timeout (design §7).
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("network setup error: {0}")]
    NetworkSetup(String),

    #[error("vmm error: {0}")]
    Vmm(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("state error: {0}")]
    State(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no available vm for plugin: {0}")]
    NoAvailableVm(String),

    #[error("ip pool exhausted")]
    PoolExhausted,

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Validation(format!("zip error: {e}"))
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mod already installed")]
    AlreadyInstalled,
    #[error("mod does not exist")]
    NotFound,
    #[error("origin `{origin}` is not allowed for `{name}`")]
    OriginNotAllowed { name: String, origin: String },
    #[error(transparent)]
    Sandbox(#[from] modweave_sandbox::Error),
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl Error {
    pub fn origin_not_allowed(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self::OriginNotAllowed {
            name: name.into(),
            origin: origin.into(),
        }
    }
}

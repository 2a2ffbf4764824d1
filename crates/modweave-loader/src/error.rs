use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("mod `{0}` is not loaded")]
    NotLoaded(i32),
    #[error("mod has no message handler")]
    NoHandler,
    #[error(transparent)]
    Sandbox(#[from] modweave_sandbox::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("container id must not be empty")]
    EmptyContainerId,
    #[error("invalid container id: {0}")]
    InvalidContainerId(String),
}
pub type Result<T> = std::result::Result<T, Error>;

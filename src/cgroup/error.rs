use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no container id pattern matched the cgroup content")]
    NoMatchFound,
    #[error(transparent)]
    InvalidContainerId(#[from] crate::container::Error),
    #[error("failed to list process directory: {0}")]
    ProcRoot(#[source] fsutil::FileReadError),
}

pub type Result<T> = std::result::Result<T, Error>;

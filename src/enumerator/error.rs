#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("node name must be defined and non-empty")]
    MissingNodeName,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to list pods with field selector `{field_selector}`: {source}")]
    ListPods {
        field_selector: String,
        #[source]
        source: kube::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

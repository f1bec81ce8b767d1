use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod error;

pub use error::{Error, Result};

/// The maximum allowed length for a [`ContainerId`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// An operating system process id as found below `/proc`.
pub type ProcessId = u64;

/// Every container on the node with the ascending ids of its live processes.
pub type ContainerProcesses = HashMap<ContainerId, Vec<ProcessId>>;

/// A validated, runtime-assigned container identifier.
///
/// Cloning is cheap, the id is shared behind an [`Arc`].
///
/// # Examples
///
/// ```
/// # use podnet_monitor::container::ContainerId;
/// let raw_id = "01db6847f45cdd13b3cba393e5f352c6027761aa8d16a2a86f7b2dd2dc03c232";
/// let container_id = ContainerId::new(raw_id).unwrap();
/// assert_eq!(container_id.as_ref(), raw_id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(Arc<str>);

impl ContainerId {
    /// Creates a new `ContainerId` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyContainerId`] for an empty input and
    /// [`Error::InvalidContainerId`] if the input exceeds [`CONTAINER_ID_MAX_LEN`] or
    /// contains whitespace or a path separator.
    ///
    /// # Examples
    ///
    /// ```
    /// # use podnet_monitor::container::{ContainerId, Error};
    /// assert!(ContainerId::new("c14ff86ea52c").is_ok());
    /// assert!(matches!(ContainerId::new(""), Err(Error::EmptyContainerId)));
    /// ```
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty() {
            return Err(Error::EmptyContainerId);
        }
        if src.len() > CONTAINER_ID_MAX_LEN
            || src.contains('/')
            || src.chars().any(char::is_whitespace)
        {
            return Err(Error::InvalidContainerId(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    /// Parses the id out of a Kubernetes container status id, e.g.
    /// `containerd://<id>`, `docker://<id>` or `cri-o://<id>`.
    ///
    /// The id is the host part of the URL-like value. Values without a runtime
    /// prefix are rejected because Kubernetes always reports one.
    pub fn from_runtime_url(url: &str) -> Result<Self> {
        let (scheme, host) = url
            .split_once("://")
            .ok_or_else(|| Error::InvalidContainerId(url.to_owned()))?;
        if scheme.is_empty() {
            return Err(Error::InvalidContainerId(url.to_owned()));
        }
        let host = host.split(['/', '?', '#']).next().unwrap_or_default();
        Self::new(host)
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ContainerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::container::{ContainerId, ProcessId};
use crate::fsutil;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    FileRead(#[from] fsutil::FileReadError),
    #[error(transparent)]
    Cgroup(#[from] crate::cgroup::Error),
    #[error("process {pid} does not exist anymore")]
    ProcessGone { pid: ProcessId },
    #[error("failed to read network devices from `{path}`: {source}")]
    NetDev {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to find `{name}` in PATH")]
    BinaryNotFound { name: String },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        output: String,
    },
    #[error("failed to parse output of `{command}`: {source}")]
    ParseOutput {
        command: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{command}` printed an invalid counter: {output}")]
    InvalidCounter { command: String, output: String },

    #[error("failed to read eBPF object `{path}`: {source}")]
    ReadObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load eBPF object `{path}`: {source}")]
    LoadObject {
        path: PathBuf,
        #[source]
        source: aya::EbpfError,
    },
    #[error("eBPF object does not contain program `{name}`")]
    MissingProgram { name: &'static str },
    #[error("eBPF object does not contain map `{name}`")]
    MissingMap { name: &'static str },
    #[error("eBPF program `{name}` failed: {source}")]
    Program {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },
    #[error("failed to access eBPF map `{name}`: {source}")]
    Map {
        name: &'static str,
        #[source]
        source: aya::maps::MapError,
    },
    #[error("no interface with index {index}: {source}")]
    UnknownInterface {
        index: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("no eBPF counter object configured")]
    NoCounterObject,

    #[error("container `{0}` is already registered")]
    AlreadyRegistered(ContainerId),
    #[error("container `{0}` is not registered")]
    NotRegistered(ContainerId),
    #[error("snoopy of container `{container_id}` emitted unsupported event type `{kind}`")]
    ProtocolViolation {
        container_id: ContainerId,
        kind: String,
    },
    #[error("refusing to start more than {limit} snoopy processes")]
    TooManyProbes { limit: usize },
    #[error("worker is not running")]
    WorkerStopped,
}

pub type Result<T> = std::result::Result<T, Error>;

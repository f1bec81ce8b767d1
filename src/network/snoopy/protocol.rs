//! The newline delimited JSON protocol spoken by snoopy on stdout and stderr.
use serde::{Deserialize, Deserializer, Serialize};

use crate::network::InterfaceName;

/// An interface as described by snoopy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoopyInterface {
    pub name: InterfaceName,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub flags: u64,
}

/// Packets and bytes counted by snoopy since it attached to the interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct InterfaceCounter {
    #[serde(deserialize_with = "counter")]
    pub packets: u64,
    #[serde(deserialize_with = "counter")]
    pub bytes: u64,
}

/// Counters are emitted as decimal strings by current snoopy releases and as numbers by
/// older ones.
fn counter<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Counter {
        Number(u64),
        Text(String),
    }

    match Counter::deserialize(deserializer)? {
        Counter::Number(value) => Ok(value),
        Counter::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum SnoopyEvent {
    InterfaceAdded {
        interface: SnoopyInterface,
    },
    InterfaceRemoved {
        interface: SnoopyInterface,
    },
    InterfaceChanged {
        previous: SnoopyInterface,
        new: SnoopyInterface,
    },
    InterfaceMetrics {
        interface: InterfaceName,
        ingress: InterfaceCounter,
        egress: InterfaceCounter,
    },
    InterfaceBpfInitialized {
        interface: InterfaceName,
        ingress_implementation: String,
        egress_implementation: String,
    },
    InterfaceBpfInitializationFailed {
        interface: InterfaceName,
        error: String,
    },
}

const EVENT_TYPES: [&str; 6] = [
    "InterfaceAdded",
    "InterfaceRemoved",
    "InterfaceChanged",
    "InterfaceMetrics",
    "InterfaceBpfInitialized",
    "InterfaceBpfInitializationFailed",
];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed snoopy message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// snoopy emitted an event this build does not know. The probe and the monitor have to
    /// be upgraded together.
    #[error("unknown snoopy event type `{0}`")]
    UnknownType(String),
}

/// Decodes one stdout line.
pub fn decode_event(line: &str) -> Result<SnoopyEvent, DecodeError> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(rename = "type")]
        kind: String,
    }

    let envelope: Envelope = serde_json::from_str(line)?;
    if !EVENT_TYPES.contains(&envelope.kind.as_str()) {
        return Err(DecodeError::UnknownType(envelope.kind));
    }
    Ok(serde_json::from_str(line)?)
}

/// One stderr line of snoopy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogMessage {
    pub level: String,
    #[serde(default)]
    pub target: String,
    pub message: String,
}

impl LogMessage {
    pub fn log_level(&self) -> log::Level {
        match self.level.as_str() {
            "ERROR" => log::Level::Error,
            "WARN" => log::Level::Warn,
            "INFO" => log::Level::Info,
            "DEBUG" => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }
}

/// A classified stderr line.
#[derive(Debug, PartialEq, Eq)]
pub enum StderrLine {
    /// nsenter itself failed, e.g. because the namespace vanished.
    Nsenter(String),
    Log(LogMessage),
    Unparsable(String),
}

pub fn classify_stderr(line: &str) -> StderrLine {
    if line.starts_with("nsenter") {
        return StderrLine::Nsenter(line.to_owned());
    }
    match serde_json::from_str(line) {
        Ok(message) => StderrLine::Log(message),
        Err(_) => StderrLine::Unparsable(line.to_owned()),
    }
}

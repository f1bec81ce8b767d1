use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::container::ProcessId;
use crate::fsutil;

use super::command;
use super::error::{Error, Result};

/// One link record of `ip --json link`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpLinkInfo {
    #[serde(default)]
    pub ifindex: u32,
    pub ifname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdisc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operstate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkmode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txqlen: Option<u32>,
    #[serde(default)]
    pub link_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    /// Index of the peer link, e.g. the host side of a veth pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_netnsid: Option<i32>,
}

impl IpLinkInfo {
    pub fn is_up(&self) -> bool {
        self.flags.iter().any(|flag| flag == "UP")
    }

    pub fn is_loopback(&self) -> bool {
        self.flags.iter().any(|flag| flag == "LOOPBACK")
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn parse_links(command: String, out: &[u8]) -> Result<Vec<IpLinkInfo>> {
    serde_json::from_slice(out).map_err(|source| Error::ParseOutput { command, source })
}

/// Lists the links of the host network namespace.
pub async fn request_interface_description() -> Result<Vec<IpLinkInfo>> {
    let args = ["--json", "link"];
    let out = command::output("ip", &args).await?;
    parse_links(command::display("ip", &args), &out)
}

/// Lists the links visible in the network namespace of `pid`.
pub async fn request_namespaced_interface_description(
    proc_root: &Path,
    pid: ProcessId,
) -> Result<Vec<IpLinkInfo>> {
    let netns = fsutil::process_dir(proc_root, pid).join("ns").join("net");
    let args = [
        format!("--target={pid}"),
        format!("--net={}", netns.display()),
        "ip".to_owned(),
        "--json".to_owned(),
        "link".to_owned(),
    ];
    let out = command::output("nsenter", &args).await?;
    parse_links(command::display("nsenter", &args), &out)
}

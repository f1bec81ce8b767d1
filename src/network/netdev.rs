use std::io::BufRead;
use std::path::Path;

use crate::container::ProcessId;
use crate::fsutil;

use super::error::{Error, Result};

/// One interface row of `/proc/<pid>/net/dev`, i.e. the kernel counters of an interface as
/// seen from the network namespace of the process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelNetworkInterfaceInfo {
    pub interface: String,

    /// Bytes received.
    pub receive_bytes: u64,
    /// Packets received.
    pub receive_packets: u64,
    pub receive_errs: u64,
    pub receive_drop: u64,
    pub receive_fifo: u64,
    pub receive_frame: u64,
    pub receive_compressed: u64,
    pub receive_multicast: u64,

    /// Bytes transmitted.
    pub transmit_bytes: u64,
    /// Packets transmitted.
    pub transmit_packets: u64,
    pub transmit_errs: u64,
    pub transmit_drop: u64,
    pub transmit_fifo: u64,
    pub transmit_colls: u64,
    pub transmit_carrier: u64,
    pub transmit_compressed: u64,
}

/// Splits an interface row into the interface name and its counter fields.
fn parse_interface_line(line: &str) -> Option<(&str, impl Iterator<Item = &str>)> {
    let (iface, data) = line.trim().split_once(':')?;
    Some((iface.trim(), data.split_whitespace()))
}

/// Builds the info from the 16 counter fields following the interface name.
///
/// Returns `None` if there are fewer than 16 fields. Unparsable values count as `0`.
fn info_from_fields<'a>(
    interface: &str,
    mut fields: impl Iterator<Item = &'a str>,
) -> Option<KernelNetworkInterfaceInfo> {
    let mut next = || fields.next().map(|v| v.parse::<u64>().unwrap_or(0));
    Some(KernelNetworkInterfaceInfo {
        interface: interface.to_owned(),
        receive_bytes: next()?,
        receive_packets: next()?,
        receive_errs: next()?,
        receive_drop: next()?,
        receive_fifo: next()?,
        receive_frame: next()?,
        receive_compressed: next()?,
        receive_multicast: next()?,
        transmit_bytes: next()?,
        transmit_packets: next()?,
        transmit_errs: next()?,
        transmit_drop: next()?,
        transmit_fifo: next()?,
        transmit_colls: next()?,
        transmit_carrier: next()?,
        transmit_compressed: next()?,
    })
}

impl KernelNetworkInterfaceInfo {
    /// Parses all interface rows of a `net/dev` formatted reader.
    ///
    /// The two header lines are skipped. Malformed rows are skipped as well.
    pub fn list_from_reader<R: BufRead>(buf: &mut R) -> std::io::Result<Vec<Self>> {
        let mut infos = Vec::new();
        let mut line = String::new();

        for _ in 0..2 {
            buf.read_line(&mut line)?;
            line.clear();
        }

        while buf.read_line(&mut line)? != 0 {
            match parse_interface_line(&line).and_then(|(iface, fields)| info_from_fields(iface, fields)) {
                Some(info) => infos.push(info),
                None if !line.trim().is_empty() => {
                    log::debug!("skipping malformed net/dev line: {}", line.trim_end());
                }
                None => {}
            }
            line.clear();
        }

        Ok(infos)
    }
}

/// Reads and parses `<proc_root>/<pid>/net/dev`.
///
/// # Errors
///
/// Returns [`Error::ProcessGone`] if the process directory does not exist anymore and
/// [`Error::NetDev`] if the file cannot be read.
pub fn read_network_interface_info(
    proc_root: &Path,
    pid: ProcessId,
) -> Result<Vec<KernelNetworkInterfaceInfo>> {
    if !fsutil::process_exists(proc_root, pid) {
        return Err(Error::ProcessGone { pid });
    }
    let path = fsutil::process_dir(proc_root, pid).join("net").join("dev");
    let mut reader = fsutil::open_file_reader(&path)?;
    KernelNetworkInterfaceInfo::list_from_reader(&mut reader)
        .map_err(|source| Error::NetDev { path, source })
}

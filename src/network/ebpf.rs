use std::ffi::CStr;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aya::Ebpf;
use aya::maps::{Array, MapData};
use aya::programs::tc::{SchedClassifierLinkId, TcAttachOptions};
use aya::programs::{LinkOrder, SchedClassifier, TcAttachType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{Error, Result};

const INGRESS_PROGRAM: &str = "count_ingress";
const EGRESS_PROGRAM: &str = "count_egress";

const INGRESS_PACKETS_MAP: &str = "ingress_pkt_count";
const INGRESS_BYTES_MAP: &str = "ingress_bytes";
const EGRESS_PACKETS_MAP: &str = "egress_pkt_count";
const EGRESS_BYTES_MAP: &str = "egress_bytes";

/// Counters of an interface since the programs were attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountState {
    pub ingress_packets: u64,
    pub ingress_bytes: u64,
    pub egress_packets: u64,
    pub egress_bytes: u64,
}

/// Attaches traffic counters to network interfaces.
pub trait CounterSource: Send + Sync + 'static {
    /// Starts counting the traffic of the interface with the given index.
    ///
    /// A sample is emitted every `tick`. Samples are dropped while the receiver is full.
    /// Cancelling `cancel` detaches the counters and closes the channel.
    fn watch_interface(
        &self,
        cancel: CancellationToken,
        interface_index: u32,
        tick: Duration,
    ) -> impl Future<Output = Result<mpsc::Receiver<CountState>>> + Send;
}

/// Loads the compiled counter object and attaches its classifiers at the TCX hooks.
///
/// The object must provide the `classifier` programs `count_ingress` and `count_egress`
/// and the single element `u64` arrays `ingress_pkt_count`, `ingress_bytes`,
/// `egress_pkt_count` and `egress_bytes`. TCX requires Linux 6.6 or newer.
#[derive(Debug)]
pub struct EbpfApi {
    object_path: PathBuf,
    memlock_removed: AtomicBool,
}

impl EbpfApi {
    pub fn new(object_path: PathBuf) -> Self {
        Self {
            object_path,
            memlock_removed: AtomicBool::new(false),
        }
    }

    /// Kernels before 5.11 account eBPF memory against `RLIMIT_MEMLOCK`.
    fn remove_memlock_limit(&self) {
        if self.memlock_removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let rlim = libc::rlimit {
            rlim_cur: libc::RLIM_INFINITY,
            rlim_max: libc::RLIM_INFINITY,
        };
        // SAFETY: `rlim` is a valid, initialized `rlimit` that outlives the call.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
        if ret != 0 {
            log::error!(
                target: "ebpf",
                "failed to remove memlock limit: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    async fn load(&self) -> Result<Ebpf> {
        let bytes = tokio::fs::read(&self.object_path)
            .await
            .map_err(|source| Error::ReadObject {
                path: self.object_path.clone(),
                source,
            })?;
        Ebpf::load(&bytes).map_err(|source| Error::LoadObject {
            path: self.object_path.clone(),
            source,
        })
    }
}

impl CounterSource for EbpfApi {
    async fn watch_interface(
        &self,
        cancel: CancellationToken,
        interface_index: u32,
        tick: Duration,
    ) -> Result<mpsc::Receiver<CountState>> {
        self.remove_memlock_limit();

        let interface = interface_name(interface_index)?;
        let mut bpf = self.load().await?;

        let ingress = attach(&mut bpf, INGRESS_PROGRAM, &interface, TcAttachType::Ingress)?;
        let egress = match attach(&mut bpf, EGRESS_PROGRAM, &interface, TcAttachType::Egress) {
            Ok(link) => link,
            Err(err) => {
                detach(&mut bpf, INGRESS_PROGRAM, ingress);
                return Err(err);
            }
        };
        log::debug!(target: "ebpf", "attached counters to {interface} ({interface_index})");

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => match read_counts(&bpf) {
                        // A full channel means the consumer has not caught up, skip the sample.
                        Ok(state) => {
                            let _ = tx.try_send(state);
                        }
                        Err(err) => log::warn!(target: "ebpf", "{interface}: {err}"),
                    },
                }
            }

            detach(&mut bpf, INGRESS_PROGRAM, ingress);
            detach(&mut bpf, EGRESS_PROGRAM, egress);
            drop(bpf);
            log::debug!(target: "ebpf", "detached counters from {interface} ({interface_index})");
        });

        Ok(rx)
    }
}

fn classifier<'a>(bpf: &'a mut Ebpf, name: &'static str) -> Result<&'a mut SchedClassifier> {
    bpf.program_mut(name)
        .ok_or(Error::MissingProgram { name })?
        .try_into()
        .map_err(|source| Error::Program { name, source })
}

fn attach(
    bpf: &mut Ebpf,
    name: &'static str,
    interface: &str,
    attach_type: TcAttachType,
) -> Result<SchedClassifierLinkId> {
    let program = classifier(bpf, name)?;
    program
        .load()
        .map_err(|source| Error::Program { name, source })?;
    program
        .attach_with_options(
            interface,
            attach_type,
            TcAttachOptions::TcxOrder(LinkOrder::default()),
        )
        .map_err(|source| Error::Program { name, source })
}

fn detach(bpf: &mut Ebpf, name: &'static str, link: SchedClassifierLinkId) {
    let result = classifier(bpf, name).and_then(|program| {
        program
            .detach(link)
            .map_err(|source| Error::Program { name, source })
    });
    if let Err(err) = result {
        log::warn!(target: "ebpf", "{err}");
    }
}

fn read_counter(bpf: &Ebpf, name: &'static str) -> Result<u64> {
    let map = bpf.map(name).ok_or(Error::MissingMap { name })?;
    let array: Array<&MapData, u64> =
        Array::try_from(map).map_err(|source| Error::Map { name, source })?;
    array.get(&0, 0).map_err(|source| Error::Map { name, source })
}

fn read_counts(bpf: &Ebpf) -> Result<CountState> {
    Ok(CountState {
        ingress_packets: read_counter(bpf, INGRESS_PACKETS_MAP)?,
        ingress_bytes: read_counter(bpf, INGRESS_BYTES_MAP)?,
        egress_packets: read_counter(bpf, EGRESS_PACKETS_MAP)?,
        egress_bytes: read_counter(bpf, EGRESS_BYTES_MAP)?,
    })
}

/// Resolves the name of an interface of the current network namespace by its index.
pub(crate) fn interface_name(index: u32) -> Result<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `buf` holds `IF_NAMESIZE` bytes, the size `if_indextoname` writes at most.
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return Err(Error::UnknownInterface {
            index,
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: on success `buf` contains a NUL terminated name within its bounds.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

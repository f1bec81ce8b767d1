use std::sync::LazyLock;

use regex::Regex;

use crate::container::ContainerId;

use super::error::{Error, Result};

/// Container id patterns of the supported runtimes, in evaluation order.
///
/// Covers containerd and CRI-O systemd scopes, legacy Docker paths, Docker cgroup v2 slice
/// naming and the generic `kubepods/.../<id>` path shapes.
static CGROUP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"cri-containerd-([0-9a-fA-F]+)\.scope",
        r"crio-([0-9a-fA-F]+)\.scope",
        r"/docker/([0-9a-fA-F]+)\.scope",
        r"docker-([0-9a-fA-F]+)\.scope",
        r"kubepods[^/]*/pod[^/]+/([0-9a-fA-F]+)",
        r"containerd:([0-9a-fA-F]+)",
        r"burstable/pod[^/]+/([0-9a-fA-F]+)",
        r"/pod[^/]+/([0-9a-fA-F]+)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("container id patterns are valid"))
    .collect()
});

/// Resolves the id of the innermost container a process belongs to from the content of its
/// `/proc/<pid>/cgroup` file.
///
/// Every line is matched against every pattern. For each pattern only its last match in the
/// line is considered, positioned at the rightmost occurrence of the captured id within the
/// line. The candidate with the greatest position wins, which is the deepest path segment
/// of a nested hierarchy. On equal positions the earlier candidate is kept.
///
/// # Errors
///
/// Returns [`Error::NoMatchFound`] if no pattern matches any line. Callers treat this as
/// "not a container process".
///
/// # Examples
///
/// ```
/// # use podnet_monitor::cgroup::resolve_container_id;
/// let cgroup = "0::/system.slice/docker-01db6847f45c.scope";
/// assert_eq!(resolve_container_id(cgroup).unwrap().as_ref(), "01db6847f45c");
/// assert!(resolve_container_id("0::/").is_err());
/// ```
pub fn resolve_container_id(cgroup: &str) -> Result<ContainerId> {
    let mut best: Option<(usize, &str)> = None;

    for line in cgroup.lines() {
        for pattern in CGROUP_PATTERNS.iter() {
            let Some(id) = pattern
                .captures_iter(line)
                .last()
                .and_then(|captures| captures.get(1))
                .map(|m| m.as_str())
            else {
                continue;
            };
            let Some(pos) = line.rfind(id) else {
                continue;
            };
            if best.is_none_or(|(best_pos, _)| pos > best_pos) {
                best = Some((pos, id));
            }
        }
    }

    let (_, id) = best.ok_or(Error::NoMatchFound)?;
    Ok(ContainerId::new(id)?)
}

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::container::ProcessId;

/// Error that occurs when opening or reading a file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to read file `{path}`: {source}")]
pub struct FileReadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Opens a file at the given path and wraps it in a [`BufReader`].
///
/// # Errors
///
/// Returns a [`FileReadError`] if the file cannot be opened.
///
/// # Example
/// ```no_run
/// # use podnet_monitor::fsutil;
/// let reader = fsutil::open_file_reader("/proc/1/net/dev")?;
/// # Ok::<(), fsutil::FileReadError>(())
/// ```
pub fn open_file_reader(path: impl AsRef<Path>) -> Result<BufReader<File>, FileReadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| FileReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Reads the whole file into a string.
///
/// # Errors
///
/// Returns a [`FileReadError`] if the file cannot be read or is not valid UTF-8.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String, FileReadError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|source| FileReadError {
        path: path.to_path_buf(),
        source,
    })
}

/// Path of a process directory below the given proc root, e.g. `/proc/1234`.
#[inline]
pub fn process_dir(proc_root: &Path, pid: ProcessId) -> PathBuf {
    proc_root.join(pid.to_string())
}

/// Whether `<proc_root>/<pid>` still exists. Errors count as "gone".
pub fn process_exists(proc_root: &Path, pid: ProcessId) -> bool {
    process_dir(proc_root, pid).try_exists().unwrap_or(false)
}

/// Lists all numeric directory entries of the proc root, i.e. the pids of running processes.
///
/// Entries which are not directories or whose name is not a decimal number are skipped.
///
/// # Errors
///
/// Returns a [`FileReadError`] if the proc root itself cannot be listed. Failures on
/// individual entries are skipped as processes may exit at any time.
pub fn list_pids(proc_root: &Path) -> Result<Vec<ProcessId>, FileReadError> {
    let entries = std::fs::read_dir(proc_root).map_err(|source| FileReadError {
        path: proc_root.to_path_buf(),
        source,
    })?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {}
            _ => continue,
        }
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<ProcessId>().ok())
        {
            pids.push(pid);
        }
    }

    Ok(pids)
}

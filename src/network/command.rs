use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::error::{Error, Result};

/// Looks up an executable by name in the directories of `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Renders a command line for logs and errors.
pub fn display<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Runs the program to completion and returns its stdout.
///
/// # Errors
///
/// Returns [`Error::Spawn`] if the program cannot be started and [`Error::CommandFailed`]
/// if it exits unsuccessfully.
pub async fn output<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Vec<u8>> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            command: display(program, args),
            source,
        })?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: display(program, args),
            status: output.status,
            output: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-an-installed-binary").is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(display("ip", &["--json", "link"]), "ip --json link");
    }

    #[tokio::test]
    async fn test_output() {
        assert_eq!(output("echo", &["hello"]).await.unwrap(), b"hello\n");
        assert!(matches!(
            output("sh", &["-c", "echo oops >&2; exit 3"]).await,
            Err(Error::CommandFailed { output, .. }) if output == "oops"
        ));
        assert!(matches!(
            output("definitely-not-an-installed-binary", &[] as &[&str]).await,
            Err(Error::Spawn { .. })
        ));
    }
}

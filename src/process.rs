//! Blocking subprocess execution with captured output.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

/// Exit status and output of a finished subprocess.
#[derive(Debug, Clone)]
pub(crate) struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr joined, trimmed for display.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (false, true) => stdout.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Run `program` in `cwd`, feeding `stdin` when given, and wait for it.
///
/// Only spawn and pipe failures are errors; a non-zero exit is reported
/// through [`Captured::code`].
pub(crate) fn run_captured<I, S>(
    program: &str,
    args: I,
    cwd: &Path,
    stdin: Option<&[u8]>,
) -> io::Result<Captured>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    debug!("Running {:?} in {}", cmd, cwd.display());

    let mut child = cmd.spawn()?;
    let writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        _ => None,
    };
    let output = child.wait_with_output()?;
    if let Some(writer) = writer {
        match writer.join() {
            Ok(Ok(())) => {}
            // The child may exit before reading all of its input.
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::other("stdin writer thread panicked")),
        }
    }

    Ok(Captured {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_exit_code_and_streams() {
        let out = run_captured(
            "sh",
            ["-c", "echo out; echo err >&2; exit 3"],
            Path::new("."),
            None,
        )
        .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr");
    }

    #[test]
    fn test_feeds_stdin() {
        let out = run_captured("sh", ["-c", "cat"], Path::new("."), Some(b"hello\n")).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = run_captured("patchline-no-such-binary", ["x"], Path::new("."), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}

//! Helpers intended for [`std::process::Command`] and related structures.

use std::process::Command;

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. A non-successful
    /// exit is turned into an error which includes the command line
    /// and the captured stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;
}

/// Render the program and arguments of a command as a shell-quoted string.
fn command_to_string(cmd: &Command) -> String {
    let args = std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy());
    let args = args.collect::<Vec<_>>();
    shlex::try_join(args.iter().map(|s| &**s))
        .unwrap_or_else(|_| format!("{cmd:?}"))
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_to_string(self));
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let cmdline = command_to_string(self);
        let output = self
            .stdin(std::process::Stdio::null())
            .output()
            .with_context(|| format!("Spawning {cmdline}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            anyhow::bail!("Subprocess failed: {cmdline}: {}", output.status)
        }
        anyhow::bail!("Subprocess failed: {cmdline}: {}: {stderr}", output.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ok() {
        Command::new("true").log_debug().run_capture_stderr().unwrap();
    }

    #[test]
    fn test_run_err_includes_stderr() {
        let e = Command::new("/bin/sh")
            .args(["-c", "echo oops >&2; exit 1"])
            .run_capture_stderr()
            .unwrap_err();
        let msg = format!("{e:#}");
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("/bin/sh -c"), "{msg}");
    }

    #[test]
    fn test_command_to_string_quotes() {
        let mut cmd = Command::new("docker");
        cmd.args(["load", "-i", "/tmp/some file.tar"]);
        let s = command_to_string(&cmd);
        assert!(s.starts_with("docker load -i "), "{s}");
        // The path with a space must not be split
        assert_ne!(s, "docker load -i /tmp/some file.tar");
    }
}

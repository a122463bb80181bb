//! Remote execution channel.
//!
//! Everything the sync pipeline does on the archive host goes through
//! [`RemoteChannel`]: run a shell command, stream a local file into a remote
//! path, test for existence, and hash. Every call carries an explicit timeout
//! and a timed-out call is reported as [`Error::Timeout`], never retried here.

pub mod local;
pub mod ssh;

pub use local::LocalChannel;
pub use ssh::SshChannel;

use crate::error::{Error, Result};
use crate::hasher::{parse_checksum_output, HashAlgorithm};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Exit code of the commit script when the destination is already taken.
const DEST_TAKEN_EXIT: i32 = 17;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait RemoteChannel: Send + Sync {
    /// Run `command` through the remote shell.
    fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Copy the bytes of `local` into `remote_path`, truncating it. Returns the
    /// exit code of the remote writer.
    fn stream_to_remote_file(&self, local: &Path, remote_path: &str, timeout: Duration)
        -> Result<i32>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    fn remote_file_exists(&self, path: &str, timeout: Duration) -> Result<bool> {
        let output = self.run_command(&format!("test -f {}", shell_quote(path)), timeout)?;
        Ok(output.success())
    }

    /// `true` if anything (file, directory, link) occupies `path`.
    fn remote_path_exists(&self, path: &str, timeout: Duration) -> Result<bool> {
        let output = self.run_command(&format!("test -e {}", shell_quote(path)), timeout)?;
        Ok(output.success())
    }

    fn remote_file_hash(
        &self,
        path: &str,
        algorithm: HashAlgorithm,
        timeout: Duration,
    ) -> Result<String> {
        let command = format!("{} {}", algorithm.remote_command(), shell_quote(path));
        let output = self.run_command(&command, timeout)?;
        if !output.success() {
            return Err(Error::Remote(format!(
                "{} exited with {}: {}",
                algorithm.remote_command(),
                output.exit_code,
                output.stderr.trim()
            )));
        }
        parse_checksum_output(&output.stdout, algorithm).ok_or_else(|| {
            Error::Remote(format!(
                "unparseable {} output for {}: {:?}",
                algorithm.remote_command(),
                path,
                output.stdout.trim()
            ))
        })
    }

    fn create_dir_all(&self, path: &str, timeout: Duration) -> Result<()> {
        let output = self.run_command(&format!("mkdir -p {}", shell_quote(path)), timeout)?;
        check_exit("mkdir", &output)
    }

    /// Move `from` to `to` unless `to` already exists. `Ok(false)` means the
    /// destination was taken and nothing was moved.
    fn rename_no_clobber(&self, from: &str, to: &str, timeout: Duration) -> Result<bool> {
        let to = shell_quote(to);
        let command = format!(
            "if [ -e {to} ]; then exit {code}; fi; mv -f {from} {to}",
            to = to,
            code = DEST_TAKEN_EXIT,
            from = shell_quote(from),
        );
        let output = self.run_command(&command, timeout)?;
        if output.exit_code == DEST_TAKEN_EXIT {
            return Ok(false);
        }
        check_exit("mv", &output).map(|_| true)
    }

    fn remove_file(&self, path: &str, timeout: Duration) -> Result<()> {
        let output = self.run_command(&format!("rm -f {}", shell_quote(path)), timeout)?;
        check_exit("rm", &output)
    }
}

fn check_exit(what: &str, output: &CommandOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(Error::Remote(format!(
            "{} exited with {}: {}",
            what,
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Spawn `cmd`, feed it `stdin`, and wait at most `timeout` for it to exit.
/// On timeout the child is killed and reaped.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    stdin: Stdio,
    label: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut child = cmd
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            kill(&mut child, label);
            return Err(Error::Timeout {
                command: label.to_string(),
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };
    debug!("{} exited with {}", label, output.exit_code);
    Ok(output)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn kill(child: &mut Child, label: &str) {
    warn!("Killing timed out command: {}", label);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/a b/c"), "'/a b/c'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_with_timeout(cmd, Stdio::null(), "sh", Duration::from_secs(10)).unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let started = Instant::now();
        let result = run_with_timeout(cmd, Stdio::null(), "sleep", Duration::from_millis(200));
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}

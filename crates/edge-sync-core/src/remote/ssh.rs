use super::{run_with_timeout, shell_quote, CommandOutput, RemoteChannel};
use crate::config::RemoteConfig;
use crate::error::Result;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Remote host reached through the system `ssh` binary, so host aliases, keys
/// and jump hosts all come from the operator's `~/.ssh/config`.
pub struct SshChannel {
    target: String,
    port: Option<u16>,
    connect_timeout_secs: u64,
}

impl SshChannel {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            port: None,
            connect_timeout_secs: 10,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            target: config.ssh_target.clone(),
            port: config.ssh_port,
            connect_timeout_secs: config.connect_timeout_secs,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&self.target).arg("--").arg(remote_command);
        cmd
    }
}

impl RemoteChannel for SshChannel {
    fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("ssh {}: {}", self.target, command);
        run_with_timeout(self.command(command), Stdio::null(), command, timeout)
    }

    fn stream_to_remote_file(
        &self,
        local: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<i32> {
        let source = File::open(local)?;
        let command = format!("cat > {}", shell_quote(remote_path));
        debug!("ssh {}: {} < {}", self.target, command, local.display());
        let output = run_with_timeout(self.command(&command), Stdio::from(source), &command, timeout)?;
        Ok(output.exit_code)
    }

    fn describe(&self) -> String {
        match self.port {
            Some(port) => format!("ssh://{}:{}", self.target, port),
            None => format!("ssh://{}", self.target),
        }
    }
}

use super::{run_with_timeout, shell_quote, CommandOutput, RemoteChannel};
use crate::error::Result;
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Archive mounted on this host (NFS/SMB share, or a scratch directory in
/// tests). Commands run through `sh -c` with the same quoting as over ssh.
#[derive(Debug, Default, Clone)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }

    fn command(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

impl RemoteChannel for LocalChannel {
    fn run_command(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!("sh: {}", command);
        run_with_timeout(Self::command(command), Stdio::null(), command, timeout)
    }

    fn stream_to_remote_file(
        &self,
        local: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<i32> {
        let source = File::open(local)?;
        let command = format!("cat > {}", shell_quote(remote_path));
        let output = run_with_timeout(Self::command(&command), Stdio::from(source), &command, timeout)?;
        Ok(output.exit_code)
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{hash_data, HashAlgorithm};
    use std::fs;
    use tempfile::tempdir;

    const T: Duration = Duration::from_secs(10);

    #[test]
    fn test_stream_exists_and_hash() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"hello world").unwrap();
        let dst = dir.path().join("out dir").join("dst.bin");
        let dst_str = dst.to_string_lossy().into_owned();

        let channel = LocalChannel::new();
        assert!(!channel.remote_file_exists(&dst_str, T).unwrap());
        channel
            .create_dir_all(&dir.path().join("out dir").to_string_lossy(), T)
            .unwrap();
        assert_eq!(channel.stream_to_remote_file(&src, &dst_str, T).unwrap(), 0);
        assert!(channel.remote_file_exists(&dst_str, T).unwrap());
        assert_eq!(
            channel
                .remote_file_hash(&dst_str, HashAlgorithm::Md5, T)
                .unwrap(),
            hash_data(b"hello world", HashAlgorithm::Md5)
        );
    }

    #[test]
    fn test_rename_never_replaces_existing_destination() {
        let dir = tempdir().unwrap();
        let temp = dir.path().join("a.jpg.tmp.1");
        let dest = dir.path().join("a.jpg");
        fs::write(&temp, b"second").unwrap();
        fs::write(&dest, b"first").unwrap();
        let (temp_str, dest_str) = (
            temp.to_string_lossy().into_owned(),
            dest.to_string_lossy().into_owned(),
        );

        let channel = LocalChannel::new();
        assert!(!channel.rename_no_clobber(&temp_str, &dest_str, T).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"first");
        assert_eq!(fs::read(&temp).unwrap(), b"second");

        fs::remove_file(&dest).unwrap();
        assert!(channel.rename_no_clobber(&temp_str, &dest_str, T).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"second");
        assert!(!temp.exists());
    }

    #[test]
    fn test_path_exists_sees_directories() {
        let dir = tempdir().unwrap();
        let channel = LocalChannel::new();
        let path = dir.path().to_string_lossy().into_owned();
        assert!(channel.remote_path_exists(&path, T).unwrap());
        assert!(!channel.remote_file_exists(&path, T).unwrap());
    }

    #[test]
    fn test_hash_of_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();
        assert!(LocalChannel::new()
            .remote_file_hash(&missing, HashAlgorithm::Sha256, T)
            .is_err());
    }
}

//! Moving files into and out of a sandbox container.
//!
//! Writes are always archive injections: the content is packed into a tar
//! archive on the host and unpacked by the engine at the destination
//! directory, so a file either appears whole or not at all. This works the
//! same whether or not the workspace is bind-mounted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use agentbox_core::{Error, Result};

use crate::archive::{self, Owner};
use crate::engine::ContainerEngine;
use crate::lifecycle::ContainerHandle;
use crate::paths::{join_path, normalize_path, shell_quote, split_parent};

/// File transfer for one sandbox.
pub struct FileTransferChannel {
    engine: Arc<dyn ContainerEngine>,
    owner: Owner,
    workspace_root: String,
}

impl FileTransferChannel {
    /// `owner` is stamped on every injected entry; relative paths are taken
    /// relative to `workspace_root`.
    pub fn new(engine: Arc<dyn ContainerEngine>, owner: Owner, workspace_root: &str) -> Self {
        Self {
            engine,
            owner,
            workspace_root: normalize_path(workspace_root),
        }
    }

    fn resolve(&self, path: &str) -> String {
        normalize_path(&join_path(&self.workspace_root, path))
    }

    async fn mkdir_p(&self, handle: &ContainerHandle, dir: &str) -> Result<()> {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p -- {}", shell_quote(dir)),
        ];
        let out = self
            .engine
            .container_exec(handle.id(), &argv, "/", None)
            .await
            .map_err(|e| Error::file_transfer(format!("creating '{}' failed: {}", dir, e)))?;
        if !out.success() {
            return Err(Error::file_transfer(format!(
                "could not create directory '{}': {}",
                dir,
                out.stderr_lossy().trim()
            )));
        }
        Ok(())
    }

    /// Write `content` to `path`, creating parent directories as needed.
    #[instrument(
        skip(self, handle, content),
        fields(container = %handle.name(), size = content.len())
    )]
    pub async fn write(
        &self,
        handle: &ContainerHandle,
        path: &str,
        content: &[u8],
    ) -> Result<String> {
        handle.ensure_running()?;
        let path = self.resolve(path);
        let (dir, name) = split_parent(&path);
        if name.is_empty() {
            return Err(Error::invalid_request(format!("'{}' is not a file path", path)));
        }

        let archive = archive::single_file(&name, content, self.owner)
            .map_err(|e| Error::file_transfer(format!("could not stage '{}': {}", path, e)))?;

        self.mkdir_p(handle, &dir).await?;
        self.engine
            .archive_inject(handle.id(), &dir, Bytes::from(archive))
            .await
            .map_err(|e| Error::file_transfer(format!("injecting '{}' failed: {}", path, e)))?;

        debug!(path = %path, "File written");
        Ok(path)
    }

    /// Read the file at `path` byte for byte.
    ///
    /// A missing or unreadable file is [`Error::FileUnreadable`]; a broken
    /// channel is [`Error::FileTransfer`].
    #[instrument(skip(self, handle), fields(container = %handle.name()))]
    pub async fn read(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        handle.ensure_running()?;
        let path = self.resolve(path);
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat -- {}", shell_quote(&path)),
        ];
        let out = self
            .engine
            .container_exec(handle.id(), &argv, "/", None)
            .await
            .map_err(|e| Error::file_transfer(format!("reading '{}' failed: {}", path, e)))?;

        if !out.success() {
            return Err(Error::FileUnreadable {
                path,
                reason: out.stderr_lossy().trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    /// Read a UTF-8 text file.
    pub async fn read_to_string(&self, handle: &ContainerHandle, path: &str) -> Result<String> {
        let bytes = self.read(handle, path).await?;
        String::from_utf8(bytes).map_err(|_| Error::FileUnreadable {
            path: self.resolve(path),
            reason: "content is not valid UTF-8".to_string(),
        })
    }

    /// Copy the contents of host directory `host_dir` into `target` inside
    /// the container.
    #[instrument(skip(self, handle), fields(container = %handle.name()))]
    pub async fn copy_tree_in(
        &self,
        handle: &ContainerHandle,
        host_dir: &Path,
        target: &str,
    ) -> Result<()> {
        handle.ensure_running()?;
        if !host_dir.is_dir() {
            return Err(Error::file_transfer(format!(
                "'{}' is not a directory",
                host_dir.display()
            )));
        }

        let dir = host_dir.to_path_buf();
        let owner = self.owner;
        let archive = tokio::task::spawn_blocking(move || archive::pack_dir(&dir, owner))
            .await
            .map_err(|e| Error::internal(format!("archive task failed: {}", e)))?
            .map_err(|e| {
                Error::file_transfer(format!("could not pack '{}': {}", host_dir.display(), e))
            })?;

        let target = self.resolve(target);
        self.mkdir_p(handle, &target).await?;
        let size = archive.len();
        self.engine
            .archive_inject(handle.id(), &target, Bytes::from(archive))
            .await
            .map_err(|e| {
                Error::file_transfer(format!("injecting tree into '{}' failed: {}", target, e))
            })?;

        debug!(target = %target, archive_bytes = size, "Tree copied in");
        Ok(())
    }

    /// Copy `source` out of the container into host directory `host_dest`.
    ///
    /// The archive is untrusted: link entries are dropped and nothing lands
    /// outside `host_dest`. Returns the number of entries written.
    #[instrument(skip(self, handle), fields(container = %handle.name()))]
    pub async fn copy_tree_out(
        &self,
        handle: &ContainerHandle,
        source: &str,
        host_dest: &Path,
    ) -> Result<usize> {
        let source = self.resolve(source);
        let archive = self
            .engine
            .archive_extract(handle.id(), &source)
            .await
            .map_err(|e| Error::file_transfer(format!("extracting '{}' failed: {}", source, e)))?;

        let dest: PathBuf = host_dest.to_path_buf();
        let written =
            tokio::task::spawn_blocking(move || archive::unpack_untrusted(&archive, &dest))
                .await
                .map_err(|e| Error::internal(format!("archive task failed: {}", e)))?
                .map_err(|e| {
                    Error::file_transfer(format!("could not unpack '{}': {}", source, e))
                })?;

        debug!(source = %source, entries = written, "Tree copied out");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;
    use crate::engine::{MockEngine, MockFailure};
    use crate::lifecycle::ContainerLifecycleManager;

    async fn setup() -> (Arc<MockEngine>, ContainerHandle, FileTransferChannel) {
        let engine = Arc::new(MockEngine::new().with_image("agentbox-sandbox:latest"));
        let lifecycle = ContainerLifecycleManager::new(engine.clone());
        let mut handle = lifecycle.create(&SandboxConfiguration::default()).await.unwrap();
        lifecycle.start(&mut handle).await.unwrap();
        let owner = Owner {
            uid: 1000,
            gid: 1000,
        };
        let channel = FileTransferChannel::new(engine.clone(), owner, "/workspace");
        (engine, handle, channel)
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let (engine, handle, channel) = setup().await;
        let path = channel.write(&handle, "src/deep/app.py", b"print('hi')\n").await.unwrap();
        assert_eq!(path, "/workspace/src/deep/app.py");
        assert_eq!(
            engine.file(handle.id(), "/workspace/src/deep/app.py"),
            Some(b"print('hi')\n".to_vec())
        );
    }

    #[tokio::test]
    async fn test_read_missing_file_is_unreadable() {
        let (_engine, handle, channel) = setup().await;
        let err = channel.read(&handle, "/workspace/nope.txt").await.unwrap_err();
        assert!(matches!(
            err,
            Error::FileUnreadable { ref path, .. } if path == "/workspace/nope.txt"
        ));
    }

    #[tokio::test]
    async fn test_failed_injection_leaves_no_file() {
        let (engine, handle, channel) = setup().await;
        engine.fail(MockFailure::Inject);
        let err = channel.write(&handle, "a.txt", b"data").await.unwrap_err();
        assert!(matches!(err, Error::FileTransfer(_)));
        assert_eq!(engine.file(handle.id(), "/workspace/a.txt"), None);
    }

    #[tokio::test]
    async fn test_mkdir_denied_is_transfer_error() {
        let (_engine, handle, channel) = setup().await;
        let err = channel.write(&handle, "/proc/x/a.txt", b"data").await.unwrap_err();
        assert!(matches!(err, Error::FileTransfer(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_transfer_error() {
        let (engine, handle, channel) = setup().await;
        engine.fail(MockFailure::Exec);
        let err = channel.read(&handle, "a.txt").await.unwrap_err();
        assert!(matches!(err, Error::FileTransfer(_)));
    }
}

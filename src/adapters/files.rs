//! Local filesystem placement.
//!
//! Ownership changes shell out to `chown -R` so group resolution matches
//! what an operator would get by hand; everything else uses tokio fs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::command::{CommandRunner, CommandSpec};
use super::{AdapterError, AdapterResult, FilePlacer, Outcome};

pub struct LocalFiles {
    chown_binary: String,
    runner: CommandRunner,
}

impl Default for LocalFiles {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFiles {
    pub fn new() -> Self {
        Self {
            chown_binary: "chown".to_string(),
            runner: CommandRunner::new(),
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), AdapterError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AdapterError::io("create parent directory", parent, e))?;
        }
        Ok(())
    }
}

/// Sibling path a tree is copied into before being renamed into place
pub fn staging_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Recursively copy `src` into `dst`, creating directories as needed
async fn copy_recursive(src: &Path, dst: &Path) -> Result<u64, AdapterError> {
    let metadata = fs::metadata(src)
        .await
        .map_err(|e| AdapterError::io("stat", src, e))?;

    if metadata.is_file() {
        fs::copy(src, dst)
            .await
            .map_err(|e| AdapterError::io("copy", src, e))?;
        return Ok(1);
    }

    let mut copied = 0;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)
            .await
            .map_err(|e| AdapterError::io("create directory", &to, e))?;

        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| AdapterError::io("read directory", &from, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AdapterError::io("read directory", &from, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| AdapterError::io("stat", &entry.path(), e))?;
            let target = to.join(entry.file_name());

            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = fs::read_link(entry.path())
                    .await
                    .map_err(|e| AdapterError::io("read link", &entry.path(), e))?;
                let _ = fs::remove_file(&target).await;
                #[cfg(unix)]
                fs::symlink(&link, &target)
                    .await
                    .map_err(|e| AdapterError::io("symlink", &target, e))?;
                copied += 1;
            } else {
                fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| AdapterError::io("copy", &entry.path(), e))?;
                copied += 1;
            }
        }
    }

    Ok(copied)
}

#[async_trait]
impl FilePlacer for LocalFiles {
    async fn copy_tree(&self, src: &Path, dst: &Path) -> AdapterResult {
        Self::ensure_parent(dst).await?;

        // Build the copy beside the destination; `dst` only appears once complete
        let staging = staging_path(dst);
        self.remove(&staging).await?;
        let copied = copy_recursive(src, &staging).await?;

        self.remove(dst).await?;
        fs::rename(&staging, dst)
            .await
            .map_err(|e| AdapterError::io("rename", &staging, e))?;

        debug!(src = %src.display(), dst = %dst.display(), copied, "Copied tree");
        Ok(Outcome::ok().with_stdout(format!("copied {} entries", copied)))
    }

    async fn move_path(&self, src: &Path, dst: &Path) -> AdapterResult {
        Self::ensure_parent(dst).await?;
        if fs::rename(src, dst).await.is_ok() {
            return Ok(Outcome::ok());
        }

        // Cross-device: copy then remove
        copy_recursive(src, dst).await?;
        self.remove(src).await
    }

    async fn chown(&self, path: &Path, user: &str, cancel: &CancellationToken) -> AdapterResult {
        let spec = CommandSpec::new(&self.chown_binary)
            .arg("-R")
            .arg(format!("{}:", user))
            .arg(path.to_string_lossy());
        self.runner.run(&spec, cancel).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> AdapterResult {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| AdapterError::io("chmod", path, e))?;
            Ok(Outcome::ok())
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Ok(Outcome::failed("chmod is only supported on unix hosts"))
        }
    }

    async fn remove(&self, path: &Path) -> AdapterResult {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Outcome::ok()),
            Err(e) => return Err(AdapterError::io("stat", path, e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        result.map_err(|e| AdapterError::io("remove", path, e))?;
        Ok(Outcome::ok())
    }

    async fn make_dir(&self, path: &Path) -> AdapterResult {
        fs::create_dir_all(path)
            .await
            .map_err(|e| AdapterError::io("create directory", path, e))?;
        Ok(Outcome::ok())
    }

    async fn append_line(&self, path: &Path, line: &str) -> AdapterResult {
        Self::ensure_parent(path).await?;

        // Keep the appended entry on its own line
        let needs_newline = match fs::read(path).await {
            Ok(existing) => !existing.is_empty() && !existing.ends_with(b"\n"),
            Err(_) => false,
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AdapterError::io("open", path, e))?;

        let mut content = String::new();
        if needs_newline {
            content.push('\n');
        }
        content.push_str(line);
        content.push('\n');

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| AdapterError::io("append", path, e))?;
        file.flush()
            .await
            .map_err(|e| AdapterError::io("flush", path, e))?;
        Ok(Outcome::ok())
    }
}

//! Adapter interfaces for external collaborators.
//!
//! Every tool the orchestrator drives (package manager, git, build tools,
//! openssl, the local filesystem, HTTP downloads) sits behind one narrow
//! trait. All of them answer with the same [`Outcome`] envelope; the
//! orchestrator never looks at tool-specific output beyond it.

pub mod apt;
pub mod build;
pub mod command;
pub mod download;
pub mod files;
pub mod git;
pub mod openssl;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use apt::AptPackages;
pub use build::{CMakeBuilder, MakeBuilder};
pub use command::{CommandRunner, CommandSpec};
pub use download::HttpFetcher;
pub use files::LocalFiles;
pub use git::GitCli;
pub use openssl::OpenSslCa;

/// How a collaborator exited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ExitInfo {
    /// Process exited with a status code
    Code { code: i32 },

    /// Process was terminated by a signal
    Signal,

    /// In-process operation (filesystem, HTTP) with no exit code
    Internal,
}

/// Uniform result envelope returned by every adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub exit: ExitInfo,
    pub stdout: String,
    pub stderr: String,
}

impl Outcome {
    /// Successful in-process operation
    pub fn ok() -> Self {
        Self {
            success: true,
            exit: ExitInfo::Internal,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Failed in-process operation with a message in place of stderr
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit: ExitInfo::Internal,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Short description of the exit, for error messages
    pub fn describe_exit(&self) -> String {
        match &self.exit {
            ExitInfo::Code { code } => format!("exited with code {}", code),
            ExitInfo::Signal => "terminated by signal".to_string(),
            ExitInfo::Internal if self.success => "completed".to_string(),
            ExitInfo::Internal => "failed".to_string(),
        }
    }
}

/// Last `lines` lines of captured output
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Adapter boundary errors (the collaborator could not be run at all)
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed for {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to acquire step resources: {0}")]
    Resources(#[from] tokio::sync::AcquireError),

    /// Stopped by cancellation or timeout; `stderr` is what it printed first
    #[error("'{program}' was cancelled")]
    Cancelled { program: String, stderr: String },
}

impl AdapterError {
    pub fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn cancelled(program: impl Into<String>) -> Self {
        Self::Cancelled {
            program: program.into(),
            stderr: String::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Collaborator output captured before the error, if any
    pub fn stderr(&self) -> &str {
        match self {
            Self::Cancelled { stderr, .. } => stderr,
            _ => "",
        }
    }
}

pub type AdapterResult = std::result::Result<Outcome, AdapterError>;

/// OS package manager
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    async fn install(&self, names: &BTreeSet<String>, cancel: &CancellationToken) -> AdapterResult;

    /// Whether a package is already installed
    async fn is_installed(&self, name: &str) -> anyhow::Result<bool>;
}

/// Version-control client
#[async_trait]
pub trait VersionControl: Send + Sync {
    fn name(&self) -> &str;

    async fn clone_repo(
        &self,
        url: &str,
        destination: &Path,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> AdapterResult;
}

/// Third-party build system
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, target_dir: &Path, target: Option<&str>, cancel: &CancellationToken) -> AdapterResult;
}

/// Certificate generator
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn name(&self) -> &str;

    async fn issue_self_signed(&self, request: &CertificateRequest, cancel: &CancellationToken) -> AdapterResult;
}

/// Parameters for a self-signed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub subject: String,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub validity_days: u32,
}

/// Filesystem placement operations
#[async_trait]
pub trait FilePlacer: Send + Sync {
    async fn copy_tree(&self, src: &Path, dst: &Path) -> AdapterResult;

    async fn move_path(&self, src: &Path, dst: &Path) -> AdapterResult;

    async fn chown(&self, path: &Path, user: &str, cancel: &CancellationToken) -> AdapterResult;

    async fn chmod(&self, path: &Path, mode: u32) -> AdapterResult;

    /// Remove a file or directory tree; absent paths are not an error
    async fn remove(&self, path: &Path) -> AdapterResult;

    async fn make_dir(&self, path: &Path) -> AdapterResult;

    async fn append_line(&self, path: &Path, line: &str) -> AdapterResult;
}

/// Remote artifact downloads
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn download(&self, url: &str, destination: &Path, cancel: &CancellationToken) -> AdapterResult;
}

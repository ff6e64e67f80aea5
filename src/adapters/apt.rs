//! Debian/Ubuntu package manager adapter (apt-get + dpkg-query).

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::{CommandRunner, CommandSpec};
use super::{AdapterResult, PackageManager};

/// apt-get backed package manager
pub struct AptPackages {
    apt_get: String,
    dpkg_query: String,
    runner: CommandRunner,
}

impl Default for AptPackages {
    fn default() -> Self {
        Self::new()
    }
}

impl AptPackages {
    pub fn new() -> Self {
        Self::with_binaries("apt-get", "dpkg-query")
    }

    pub fn with_binaries(apt_get: impl Into<String>, dpkg_query: impl Into<String>) -> Self {
        Self {
            apt_get: apt_get.into(),
            dpkg_query: dpkg_query.into(),
            runner: CommandRunner::new(),
        }
    }

    fn install_command(&self, names: &BTreeSet<String>) -> CommandSpec {
        CommandSpec::new(&self.apt_get)
            .args(["install", "-y", "--no-install-recommends"])
            .args(names.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
    }
}

#[async_trait]
impl PackageManager for AptPackages {
    fn name(&self) -> &str {
        "apt"
    }

    async fn install(&self, names: &BTreeSet<String>, cancel: &CancellationToken) -> AdapterResult {
        self.runner.run(&self.install_command(names), cancel).await
    }

    async fn is_installed(&self, name: &str) -> Result<bool> {
        let output = tokio::process::Command::new(&self.dpkg_query)
            .args(["-W", "-f=${Status}", name])
            .output()
            .await
            .with_context(|| format!("Failed to run {} for '{}'", self.dpkg_query, name))?;

        // dpkg-query exits 1 for unknown packages
        if !output.status.success() {
            return Ok(false);
        }

        let status = String::from_utf8_lossy(&output.stdout);
        Ok(status.contains("install ok installed"))
    }
}

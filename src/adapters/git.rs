//! Git adapter using the `git` CLI.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::{CommandRunner, CommandSpec};
use super::{AdapterResult, VersionControl};

pub struct GitCli {
    binary_path: String,
    runner: CommandRunner,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::with_binary_path("git")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            runner: CommandRunner::new(),
        }
    }

    fn clone_command(&self, url: &str, destination: &Path, branch: Option<&str>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.binary_path).args(["clone", "--depth", "1"]);
        if let Some(branch) = branch {
            spec = spec.args(["--branch", branch]);
        }
        spec.arg(url)
            .arg(destination.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0")
    }
}

#[async_trait]
impl VersionControl for GitCli {
    fn name(&self) -> &str {
        "git"
    }

    async fn clone_repo(
        &self,
        url: &str,
        destination: &Path,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> AdapterResult {
        let spec = self.clone_command(url, destination, branch);
        self.runner.run(&spec, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_command_shallow() {
        let git = GitCli::new();
        let spec = git.clone_command(
            "https://github.com/example/tool.git",
            Path::new("/opt/tools/tool"),
            None,
        );
        assert_eq!(
            spec.display(),
            "git clone --depth 1 https://github.com/example/tool.git /opt/tools/tool"
        );
    }

    #[test]
    fn test_clone_command_with_branch() {
        let git = GitCli::with_binary_path("/usr/local/bin/git");
        let spec = git.clone_command("https://example.com/r.git", Path::new("r"), Some("v2"));
        assert_eq!(spec.program, "/usr/local/bin/git");
        assert!(spec.args.windows(2).any(|w| w == ["--branch", "v2"]));
    }
}

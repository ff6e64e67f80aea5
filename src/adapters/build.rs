//! Build-system adapters (make, cmake).

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::command::{CommandRunner, CommandSpec};
use super::{AdapterResult, Builder};

/// `make -C <dir> [target]`
pub struct MakeBuilder {
    binary_path: String,
    runner: CommandRunner,
}

impl Default for MakeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MakeBuilder {
    pub fn new() -> Self {
        Self::with_binary_path("make")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            runner: CommandRunner::new(),
        }
    }

    fn command(&self, target_dir: &Path, target: Option<&str>) -> CommandSpec {
        let spec = CommandSpec::new(&self.binary_path)
            .arg("-C")
            .arg(target_dir.to_string_lossy());
        match target {
            Some(target) => spec.arg(target),
            None => spec,
        }
    }
}

#[async_trait]
impl Builder for MakeBuilder {
    fn name(&self) -> &str {
        "make"
    }

    async fn run(&self, target_dir: &Path, target: Option<&str>, cancel: &CancellationToken) -> AdapterResult {
        self.runner.run(&self.command(target_dir, target), cancel).await
    }
}

/// Out-of-source cmake build into `<dir>/build`
pub struct CMakeBuilder {
    binary_path: String,
    runner: CommandRunner,
}

impl Default for CMakeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CMakeBuilder {
    pub fn new() -> Self {
        Self::with_binary_path("cmake")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            runner: CommandRunner::new(),
        }
    }

    fn configure_command(&self, target_dir: &Path) -> CommandSpec {
        let build_dir = target_dir.join("build");
        CommandSpec::new(&self.binary_path)
            .arg("-S")
            .arg(target_dir.to_string_lossy())
            .arg("-B")
            .arg(build_dir.to_string_lossy())
    }

    fn build_command(&self, target_dir: &Path, target: Option<&str>) -> CommandSpec {
        let build_dir = target_dir.join("build");
        let spec = CommandSpec::new(&self.binary_path)
            .arg("--build")
            .arg(build_dir.to_string_lossy());
        match target {
            Some(target) => spec.args(["--target", target]),
            None => spec,
        }
    }
}

#[async_trait]
impl Builder for CMakeBuilder {
    fn name(&self) -> &str {
        "cmake"
    }

    async fn run(&self, target_dir: &Path, target: Option<&str>, cancel: &CancellationToken) -> AdapterResult {
        let configured = self.runner.run(&self.configure_command(target_dir), cancel).await?;
        if !configured.success {
            return Ok(configured);
        }
        self.runner
            .run(&self.build_command(target_dir, target), cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_command() {
        let make = MakeBuilder::new();
        assert_eq!(make.command(Path::new("/src/tool"), None).display(), "make -C /src/tool");
        assert_eq!(
            make.command(Path::new("/src/tool"), Some("install")).display(),
            "make -C /src/tool install"
        );
    }

    #[test]
    fn test_cmake_commands() {
        let cmake = CMakeBuilder::new();
        assert_eq!(
            cmake.configure_command(Path::new("/src/t")).display(),
            "cmake -S /src/t -B /src/t/build"
        );
        assert_eq!(
            cmake.build_command(Path::new("/src/t"), Some("all")).display(),
            "cmake --build /src/t/build --target all"
        );
    }
}

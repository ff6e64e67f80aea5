//! Shared fixtures: a scratch host backed by recording fake adapters.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use provision::adapters::{
    AdapterResult, Builder, CertificateAuthority, CertificateRequest, CommandRunner, Fetcher,
    FilePlacer, LocalFiles, Outcome, PackageManager, VersionControl,
};
use provision::context::{HostContext, InvokingUser, Toolbox};
use provision::core::StepAction;

/// Mutating calls made against fake collaborators
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub struct FakePackages {
    log: Arc<CallLog>,
    installed: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl PackageManager for FakePackages {
    fn name(&self) -> &str {
        "fake-apt"
    }

    async fn install(&self, names: &BTreeSet<String>, _cancel: &CancellationToken) -> AdapterResult {
        let list: Vec<&str> = names.iter().map(String::as_str).collect();
        self.log.record(format!("install {}", list.join(" ")));
        self.installed.lock().unwrap().extend(names.iter().cloned());
        Ok(Outcome::ok())
    }

    async fn is_installed(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.installed.lock().unwrap().contains(name))
    }
}

/// Clones by creating `<dest>/.git`; can be told to fail first
pub struct FakeVcs {
    log: Arc<CallLog>,
    pub failures_left: AtomicU32,
}

#[async_trait]
impl VersionControl for FakeVcs {
    fn name(&self) -> &str {
        "fake-git"
    }

    async fn clone_repo(
        &self,
        url: &str,
        destination: &Path,
        _branch: Option<&str>,
        _cancel: &CancellationToken,
    ) -> AdapterResult {
        self.log.record(format!("clone {}", url));
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(Outcome::failed("fatal: unable to access repository"));
        }
        std::fs::create_dir_all(destination.join(".git")).unwrap();
        Ok(Outcome::ok())
    }
}

pub struct FakeBuilder {
    log: Arc<CallLog>,
}

#[async_trait]
impl Builder for FakeBuilder {
    fn name(&self) -> &str {
        "fake-make"
    }

    async fn run(&self, target_dir: &Path, _target: Option<&str>, _cancel: &CancellationToken) -> AdapterResult {
        self.log.record(format!("build {}", target_dir.display()));
        Ok(Outcome::ok())
    }
}

pub struct FakeCa {
    log: Arc<CallLog>,
}

#[async_trait]
impl CertificateAuthority for FakeCa {
    fn name(&self) -> &str {
        "fake-openssl"
    }

    async fn issue_self_signed(&self, request: &CertificateRequest, _cancel: &CancellationToken) -> AdapterResult {
        self.log.record(format!("certificate {}", request.subject));
        std::fs::write(&request.key_path, "KEY").unwrap();
        std::fs::write(&request.cert_path, "CERT").unwrap();
        Ok(Outcome::ok())
    }
}

pub struct FakeFetcher {
    log: Arc<CallLog>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn download(&self, url: &str, destination: &Path, _cancel: &CancellationToken) -> AdapterResult {
        self.log.record(format!("download {}", url));
        std::fs::write(destination, "payload").unwrap();
        Ok(Outcome::ok())
    }
}

/// Real filesystem operations, recorded in their own log
pub struct RecordingFiles {
    log: Arc<CallLog>,
    inner: LocalFiles,
}

#[async_trait]
impl FilePlacer for RecordingFiles {
    async fn copy_tree(&self, src: &Path, dst: &Path) -> AdapterResult {
        self.log.record(format!("copy_tree {}", dst.display()));
        self.inner.copy_tree(src, dst).await
    }

    async fn move_path(&self, src: &Path, dst: &Path) -> AdapterResult {
        self.log.record(format!("move {}", dst.display()));
        self.inner.move_path(src, dst).await
    }

    async fn chown(&self, path: &Path, user: &str, cancel: &CancellationToken) -> AdapterResult {
        self.log.record(format!("chown {} {}", user, path.display()));
        self.inner.chown(path, user, cancel).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> AdapterResult {
        self.log.record(format!("chmod {:o} {}", mode, path.display()));
        self.inner.chmod(path, mode).await
    }

    async fn remove(&self, path: &Path) -> AdapterResult {
        self.log.record(format!("remove {}", path.display()));
        self.inner.remove(path).await
    }

    async fn make_dir(&self, path: &Path) -> AdapterResult {
        self.log.record(format!("make_dir {}", path.display()));
        self.inner.make_dir(path).await
    }

    async fn append_line(&self, path: &Path, line: &str) -> AdapterResult {
        self.log.record(format!("append_line {}", path.display()));
        self.inner.append_line(path, line).await
    }
}

/// Name of the user running the tests
#[cfg(unix)]
pub fn current_user() -> String {
    use nix::unistd::{Uid, User};
    User::from_uid(Uid::current()).unwrap().unwrap().name
}

/// A temporary host: install root, home directory and fake tools
pub struct TestHost {
    pub temp: TempDir,
    pub log: Arc<CallLog>,
    /// Filesystem calls, kept apart from the fake tool calls
    pub file_log: Arc<CallLog>,
    pub vcs: Arc<FakeVcs>,
    pub ctx: Arc<HostContext>,
}

impl TestHost {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let home = temp.path().join("home");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&home).unwrap();

        let log = Arc::new(CallLog::default());
        let file_log = Arc::new(CallLog::default());
        let vcs = Arc::new(FakeVcs {
            log: log.clone(),
            failures_left: AtomicU32::new(0),
        });

        let tools = Toolbox {
            packages: Arc::new(FakePackages {
                log: log.clone(),
                installed: Mutex::new(BTreeSet::new()),
            }),
            vcs: vcs.clone(),
            make: Arc::new(FakeBuilder { log: log.clone() }),
            cmake: Arc::new(FakeBuilder { log: log.clone() }),
            ca: Arc::new(FakeCa { log: log.clone() }),
            files: Arc::new(RecordingFiles {
                log: file_log.clone(),
                inner: LocalFiles::new(),
            }),
            fetcher: Arc::new(FakeFetcher { log: log.clone() }),
            commands: CommandRunner::new(),
        };

        let user = InvokingUser {
            name: "operator".into(),
            home,
        };
        let ctx = Arc::new(HostContext::new(user, root, tools));

        Self {
            temp,
            log,
            file_log,
            vcs,
            ctx,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.ctx.install_root.clone()
    }

    pub fn home(&self) -> PathBuf {
        self.ctx.user.home.clone()
    }
}

/// Async action that sleeps and records peak concurrency
pub struct SleepAction {
    pub label: String,
    pub duration: Duration,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl SleepAction {
    pub fn new(label: &str, duration: Duration, running: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        Self {
            label: label.to_string(),
            duration,
            running: running.clone(),
            peak: peak.clone(),
        }
    }
}

#[async_trait]
impl StepAction for SleepAction {
    async fn run(&self, _ctx: &HostContext, cancel: &CancellationToken) -> AdapterResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = cancel.cancelled() => {}
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Outcome::ok())
    }

    fn describe(&self) -> String {
        format!("sleep ({})", self.label)
    }
}

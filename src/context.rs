//! Host context handed to every step.
//!
//! Built once at startup from the environment and configuration, then
//! shared read-only for the whole run. Steps never read process-wide
//! environment variables themselves.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::adapters::{
    AptPackages, Builder, CMakeBuilder, CertificateAuthority, CommandRunner, FilePlacer, Fetcher,
    GitCli, HttpFetcher, LocalFiles, MakeBuilder, OpenSslCa, PackageManager, VersionControl,
};
use crate::config::ResolvedConfig;

/// The non-privileged identity that will own produced artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokingUser {
    pub name: String,
    pub home: PathBuf,
}

impl InvokingUser {
    /// Resolve the invoking user.
    ///
    /// Priority: explicit override, `SUDO_USER` (so `sudo provision apply`
    /// still hands artifacts to the operator), then `USER`.
    pub fn resolve(explicit: Option<&str>) -> Result<Self> {
        let name = explicit
            .map(str::to_string)
            .or_else(|| std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty()))
            .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
            .context("Cannot determine invoking user (set PROVISION_USER)")?;

        let home = lookup_home(&name)?
            .or_else(|| {
                // Unknown to the user database; only trust $HOME for ourselves
                if std::env::var("USER").ok().as_deref() == Some(name.as_str()) {
                    dirs::home_dir()
                } else {
                    None
                }
            })
            .unwrap_or_else(|| PathBuf::from("/home").join(&name));

        Ok(Self { name, home })
    }
}

/// A user's home directory from the system user database (NSS)
#[cfg(unix)]
pub fn lookup_home(user: &str) -> Result<Option<PathBuf>> {
    let entry = nix::unistd::User::from_name(user)
        .with_context(|| format!("Failed to look up user '{}'", user))?;
    Ok(entry.map(|entry| entry.dir))
}

#[cfg(not(unix))]
pub fn lookup_home(_user: &str) -> Result<Option<PathBuf>> {
    Ok(None)
}

/// A user's numeric uid from the system user database (NSS)
#[cfg(unix)]
pub fn lookup_uid(user: &str) -> Result<Option<u32>> {
    let entry = nix::unistd::User::from_name(user)
        .with_context(|| format!("Failed to look up user '{}'", user))?;
    Ok(entry.map(|entry| entry.uid.as_raw()))
}

/// External collaborators available to step actions
#[derive(Clone)]
pub struct Toolbox {
    pub packages: Arc<dyn PackageManager>,
    pub vcs: Arc<dyn VersionControl>,
    pub make: Arc<dyn Builder>,
    pub cmake: Arc<dyn Builder>,
    pub ca: Arc<dyn CertificateAuthority>,
    pub files: Arc<dyn FilePlacer>,
    pub fetcher: Arc<dyn Fetcher>,
    pub commands: CommandRunner,
}

impl Toolbox {
    /// Real adapters, with binary names taken from configuration
    pub fn system(config: &ResolvedConfig) -> Self {
        let tools = &config.tools;
        Self {
            packages: Arc::new(AptPackages::with_binaries(&tools.apt_get, &tools.dpkg_query)),
            vcs: Arc::new(GitCli::with_binary_path(&tools.git)),
            make: Arc::new(MakeBuilder::with_binary_path(&tools.make)),
            cmake: Arc::new(CMakeBuilder::with_binary_path(&tools.cmake)),
            ca: Arc::new(OpenSslCa::with_binary_path(&tools.openssl)),
            files: Arc::new(LocalFiles::new()),
            fetcher: Arc::new(HttpFetcher::new()),
            commands: CommandRunner::new(),
        }
    }
}

/// Everything a step may know about the host it provisions
#[derive(Clone)]
pub struct HostContext {
    pub user: InvokingUser,
    pub install_root: PathBuf,
    pub tools: Toolbox,
}

impl HostContext {
    pub fn new(user: InvokingUser, install_root: impl Into<PathBuf>, tools: Toolbox) -> Self {
        Self {
            user,
            install_root: install_root.into(),
            tools,
        }
    }

    /// Build the context for a real run
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let user = InvokingUser::resolve(config.user.as_deref())?;
        Ok(Self::new(user, config.install_root.clone(), Toolbox::system(config)))
    }

    /// Expand `{root}`, `{user}` and `{home}` placeholders
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{root}", &self.install_root.to_string_lossy())
            .replace("{user}", &self.user.name)
            .replace("{home}", &self.user.home.to_string_lossy())
    }

    /// Expand placeholders and anchor relative paths at the install root
    pub fn resolve_path(&self, template: &str) -> PathBuf {
        let expanded = PathBuf::from(self.expand(template));
        if expanded.is_absolute() {
            expanded
        } else {
            self.install_root.join(expanded)
        }
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("user", &self.user)
            .field("install_root", &self.install_root)
            .finish_non_exhaustive()
    }
}

//! Configuration for provision runs.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PROVISION_ROOT, PROVISION_PLANS, PROVISION_USER)
//! 2. Config file (.provision/config.yaml)
//! 3. Defaults (/opt/provision, ./plans)
//!
//! Config file discovery:
//! - Searches current directory and parents for .provision/config.yaml
//! - Relative paths in the config file are relative to the directory that
//!   contains `.provision/`
//!
//! The resolved configuration is built once by the CLI and passed down
//! explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ResourceLimits;

/// Name of the per-project configuration directory
pub const CONFIG_DIR: &str = ".provision";

/// Install root used when nothing else is configured
pub const DEFAULT_INSTALL_ROOT: &str = "/opt/provision";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Install root for relative step paths
    pub root: Option<String>,
    /// Directory holding plan documents
    pub plans: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConcurrencyConfig {
    pub jobs: Option<usize>,
    pub network: Option<usize>,
    pub build: Option<usize>,
    pub local: Option<usize>,
}

/// Binary names for the external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_apt_get")]
    pub apt_get: String,
    #[serde(default = "default_dpkg_query")]
    pub dpkg_query: String,
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_make")]
    pub make: String,
    #[serde(default = "default_cmake")]
    pub cmake: String,
    #[serde(default = "default_openssl")]
    pub openssl: String,
}

fn default_apt_get() -> String {
    "apt-get".to_string()
}
fn default_dpkg_query() -> String {
    "dpkg-query".to_string()
}
fn default_git() -> String {
    "git".to_string()
}
fn default_make() -> String {
    "make".to_string()
}
fn default_cmake() -> String {
    "cmake".to_string()
}
fn default_openssl() -> String {
    "openssl".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            apt_get: default_apt_get(),
            dpkg_query: default_dpkg_query(),
            git: default_git(),
            make: default_make(),
            cmake: default_cmake(),
            openssl: default_openssl(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    /// Timeout applied to steps that declare none
    pub timeout_seconds: Option<u64>,
    /// Owner of produced artifacts when PROVISION_USER is unset
    pub user: Option<String>,
}

/// Resolved concurrency settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencySettings {
    /// Steps in flight at once (1 = sequential)
    pub jobs: usize,
    #[serde(flatten)]
    pub limits: ResourceLimits,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            jobs: 1,
            limits: ResourceLimits::default(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub install_root: PathBuf,
    pub plans_dir: PathBuf,
    /// Explicit invoking user; `None` falls back to SUDO_USER / USER
    pub user: Option<String>,
    pub tools: ToolsConfig,
    pub concurrency: ConcurrencySettings,
    #[serde(rename = "default_timeout_seconds", serialize_with = "serialize_secs")]
    pub default_timeout: Option<Duration>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

fn serialize_secs<S: serde::Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    value.map(|d| d.as_secs()).serialize(serializer)
}

impl ResolvedConfig {
    /// Defaults anchored at a given install root
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            plans_dir: root.join("plans"),
            install_root: root,
            user: None,
            tools: ToolsConfig::default(),
            concurrency: ConcurrencySettings::default(),
            default_timeout: None,
            config_file: None,
        }
    }

    /// Lock file guarding the install root during `apply`
    pub fn lock_path(&self) -> PathBuf {
        self.install_root.join(".provision.lock")
    }

    /// Path of a named plan document under the plans directory
    pub fn plan_path(&self, name: &str) -> PathBuf {
        self.plans_dir.join(format!("{}.yaml", name))
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from the process environment and working directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, |key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

/// Load configuration starting discovery at `start`, reading variables via `env`
pub fn load_config_from(start: &Path, env: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig> {
    let config_file = find_config_file(start);

    let (file, base_dir) = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;
            // Parent of .provision/ is the project root
            let base_dir = config_path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or(start)
                .to_path_buf();
            (file, base_dir)
        }
        None => (ConfigFile::default(), start.to_path_buf()),
    };

    let install_root = env("PROVISION_ROOT")
        .map(PathBuf::from)
        .or_else(|| file.paths.root.as_deref().map(|p| resolve_path(&base_dir, p)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_ROOT));

    let plans_dir = env("PROVISION_PLANS")
        .map(PathBuf::from)
        .or_else(|| file.paths.plans.as_deref().map(|p| resolve_path(&base_dir, p)))
        .unwrap_or_else(|| base_dir.join("plans"));

    let user = env("PROVISION_USER").or(file.defaults.user);

    let defaults = ResourceLimits::default();
    let concurrency = ConcurrencySettings {
        jobs: file.concurrency.jobs.unwrap_or(1).max(1),
        limits: ResourceLimits {
            network: file.concurrency.network.unwrap_or(defaults.network),
            build: file.concurrency.build.unwrap_or(defaults.build),
            local: file.concurrency.local.unwrap_or(defaults.local),
        },
    };

    Ok(ResolvedConfig {
        install_root,
        plans_dir,
        user,
        tools: file.tools,
        concurrency,
        default_timeout: file.defaults.timeout_seconds.map(Duration::from_secs),
        config_file,
    })
}

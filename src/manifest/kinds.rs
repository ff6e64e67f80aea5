//! Built-in step kinds.
//!
//! Each kind knows three things: the action it performs through the
//! toolbox, the checks that make it idempotent, and the resources it
//! contends for.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterResult, CertificateRequest, CommandSpec, Outcome};
use crate::context::HostContext;
use crate::core::checks::parse_mode;
use crate::core::{Check, ConcurrencyClass, RetryPolicy, StepAction};

/// Lock tag shared by every package-manager step
pub const PACKAGE_MANAGER_LOCK: &str = "package-manager";

fn default_validity_days() -> u32 {
    365
}

/// Build system driving a `build` step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTool {
    #[default]
    Make,
    Cmake,
}

/// What a step does, selected by `kind:` in plan documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Install OS packages
    Packages { names: Vec<String> },

    /// Shallow-clone a repository
    Clone {
        url: String,
        dest: String,
        #[serde(default)]
        branch: Option<String>,
    },

    /// Build a source tree with make or cmake
    Build {
        dir: String,
        #[serde(default)]
        tool: BuildTool,
        #[serde(default)]
        target: Option<String>,
        /// Artifact whose presence means the build already happened
        #[serde(default)]
        creates: Option<String>,
    },

    /// Self-signed key and certificate pair
    Certificate {
        subject: String,
        key: String,
        cert: String,
        #[serde(default = "default_validity_days")]
        days: u32,
    },

    CopyTree { src: String, dest: String },

    Move { src: String, dest: String },

    MakeDir { path: String },

    /// Recursive ownership change; defaults to the invoking user
    Chown {
        path: String,
        #[serde(default)]
        user: Option<String>,
    },

    /// Octal permission bits, e.g. "755"
    Chmod { path: String, mode: String },

    AppendLine { path: String, line: String },

    Download {
        url: String,
        dest: String,
        #[serde(default)]
        sha256: Option<String>,
    },

    /// Arbitrary command for anything the other kinds don't cover
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        creates: Option<String>,
    },
}

impl StepKind {
    /// Reject documents that can never run, before anything executes
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Packages { names } if names.is_empty() => Err("packages step lists no names".into()),
            Self::Chmod { mode, .. } => parse_mode(mode).map(|_| ()).map_err(|e| format!("{:#}", e)),
            Self::Download {
                sha256: Some(digest),
                ..
            } if digest.len() != 64 || hex::decode(digest).is_err() => {
                Err(format!("'{}' is not a hex SHA-256 digest", digest))
            }
            Self::Exec { program, .. } if program.trim().is_empty() => Err("exec step has no program".into()),
            _ => Ok(()),
        }
    }

    /// Check that makes a second run skip this step
    pub fn default_precondition(&self) -> Option<Check> {
        match self {
            Self::Packages { names } => Some(Check::packages_installed(names.clone())),
            Self::Clone { dest, .. } => Some(Check::path_exists(format!("{}/.git", dest))),
            Self::Build { creates, .. } | Self::Exec { creates, .. } => {
                creates.as_ref().map(|path| Check::path_exists(path.clone()))
            }
            Self::Certificate { key, cert, .. } => {
                Some(Check::path_exists(key.clone()).and(Check::path_exists(cert.clone())))
            }
            Self::CopyTree { dest, .. } => Some(Check::path_exists(dest.clone())),
            Self::Move { src, dest } => Some(Check::path_exists(dest.clone()).and(Check::Not {
                not: Box::new(Check::path_exists(src.clone())),
            })),
            Self::MakeDir { path } => Some(Check::path_exists(path.clone())),
            Self::Chown { path, user } => Some(Check::owned_by(path.clone(), user.clone())),
            Self::Chmod { path, mode } => Some(Check::mode_is(path.clone(), mode.clone())),
            Self::AppendLine { path, line } => Some(Check::file_has_line(path.clone(), line.clone())),
            Self::Download { dest, sha256, .. } => Some(match sha256 {
                Some(digest) => Check::sha256_matches(dest.clone(), digest.clone()),
                None => Check::path_exists(dest.clone()),
            }),
        }
    }

    /// Check confirming the action achieved its effect
    pub fn default_verify(&self) -> Option<Check> {
        match self {
            Self::Move { dest, .. } => Some(Check::path_exists(dest.clone())),
            other => other.default_precondition(),
        }
    }

    pub fn default_class(&self) -> ConcurrencyClass {
        match self {
            Self::Packages { .. } | Self::Clone { .. } | Self::Download { .. } => ConcurrencyClass::Network,
            Self::Build { .. } => ConcurrencyClass::Build,
            _ => ConcurrencyClass::Local,
        }
    }

    pub fn default_retry(&self) -> RetryPolicy {
        match self.default_class() {
            ConcurrencyClass::Network => RetryPolicy::network(),
            _ => RetryPolicy::once(),
        }
    }

    /// Lock tags for the paths this kind writes
    pub fn default_locks(&self, ctx: &HostContext) -> BTreeSet<String> {
        let tag = |template: &str| ctx.resolve_path(template).to_string_lossy().into_owned();
        let mut locks = BTreeSet::new();
        match self {
            Self::Packages { .. } => {
                locks.insert(PACKAGE_MANAGER_LOCK.to_string());
            }
            Self::Clone { dest, .. }
            | Self::CopyTree { dest, .. }
            | Self::Download { dest, .. } => {
                locks.insert(tag(dest));
            }
            Self::Build { dir, .. } => {
                locks.insert(tag(dir));
            }
            Self::Certificate { key, cert, .. } => {
                locks.insert(tag(key));
                locks.insert(tag(cert));
            }
            Self::Move { src, dest } => {
                locks.insert(tag(src));
                locks.insert(tag(dest));
            }
            Self::MakeDir { path }
            | Self::Chown { path, .. }
            | Self::Chmod { path, .. }
            | Self::AppendLine { path, .. } => {
                locks.insert(tag(path));
            }
            Self::Exec { .. } => {}
        }
        locks
    }
}

/// Step action backed by a [`StepKind`]
#[derive(Debug, Clone)]
pub struct KindAction {
    kind: StepKind,
}

impl KindAction {
    pub fn new(kind: StepKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }
}

/// Create the parent directory of a file about to be written
async fn ensure_parent(ctx: &HostContext, path: &Path) -> AdapterResult {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ctx.tools.files.make_dir(parent).await,
        _ => Ok(Outcome::ok()),
    }
}

#[async_trait]
impl StepAction for KindAction {
    async fn run(&self, ctx: &HostContext, cancel: &CancellationToken) -> AdapterResult {
        let tools = &ctx.tools;

        match &self.kind {
            StepKind::Packages { names } => {
                let names: BTreeSet<String> = names.iter().map(|n| ctx.expand(n)).collect();
                tools.packages.install(&names, cancel).await
            }

            StepKind::Clone { url, dest, branch } => {
                let dest = ctx.resolve_path(dest);
                // Clear leftovers so the clone always starts from an empty target
                let cleared = tools.files.remove(&dest).await?;
                if !cleared.success {
                    return Ok(cleared);
                }
                let parent = ensure_parent(ctx, &dest).await?;
                if !parent.success {
                    return Ok(parent);
                }
                tools.vcs.clone_repo(&ctx.expand(url), &dest, branch.as_deref(), cancel).await
            }

            StepKind::Build { dir, tool, target, .. } => {
                let dir = ctx.resolve_path(dir);
                let builder = match tool {
                    BuildTool::Make => &tools.make,
                    BuildTool::Cmake => &tools.cmake,
                };
                builder.run(&dir, target.as_deref(), cancel).await
            }

            StepKind::Certificate { subject, key, cert, days } => {
                let request = CertificateRequest {
                    subject: ctx.expand(subject),
                    key_path: ctx.resolve_path(key),
                    cert_path: ctx.resolve_path(cert),
                    validity_days: *days,
                };
                for path in [&request.key_path, &request.cert_path] {
                    let parent = ensure_parent(ctx, path).await?;
                    if !parent.success {
                        return Ok(parent);
                    }
                }
                tools.ca.issue_self_signed(&request, cancel).await
            }

            StepKind::CopyTree { src, dest } => {
                tools.files.copy_tree(&ctx.resolve_path(src), &ctx.resolve_path(dest)).await
            }

            StepKind::Move { src, dest } => {
                let dest = ctx.resolve_path(dest);
                let parent = ensure_parent(ctx, &dest).await?;
                if !parent.success {
                    return Ok(parent);
                }
                tools.files.move_path(&ctx.resolve_path(src), &dest).await
            }

            StepKind::MakeDir { path } => tools.files.make_dir(&ctx.resolve_path(path)).await,

            StepKind::Chown { path, user } => {
                let user = user.as_deref().map(|u| ctx.expand(u)).unwrap_or_else(|| ctx.user.name.clone());
                tools.files.chown(&ctx.resolve_path(path), &user, cancel).await
            }

            StepKind::Chmod { path, mode } => match parse_mode(mode) {
                Ok(bits) => tools.files.chmod(&ctx.resolve_path(path), bits).await,
                Err(e) => Ok(Outcome::failed(format!("{:#}", e))),
            },

            StepKind::AppendLine { path, line } => {
                let path = ctx.resolve_path(path);
                let parent = ensure_parent(ctx, &path).await?;
                if !parent.success {
                    return Ok(parent);
                }
                tools.files.append_line(&path, &ctx.expand(line)).await
            }

            StepKind::Download { url, dest, .. } => {
                let dest = ctx.resolve_path(dest);
                let parent = ensure_parent(ctx, &dest).await?;
                if !parent.success {
                    return Ok(parent);
                }
                tools.fetcher.download(&ctx.expand(url), &dest, cancel).await
            }

            StepKind::Exec { program, args, cwd, .. } => {
                let mut spec = CommandSpec::new(ctx.expand(program)).args(args.iter().map(|a| ctx.expand(a)));
                if let Some(dir) = cwd {
                    spec = spec.cwd(ctx.resolve_path(dir));
                }
                tools.commands.run(&spec, cancel).await
            }
        }
    }

    fn describe(&self) -> String {
        match &self.kind {
            StepKind::Packages { names } => format!("install packages {}", names.join(" ")),
            StepKind::Clone { url, dest, .. } => format!("clone {} into {}", url, dest),
            StepKind::Build { dir, tool, target, .. } => {
                let tool = match tool {
                    BuildTool::Make => "make",
                    BuildTool::Cmake => "cmake",
                };
                match target {
                    Some(target) => format!("{} {} in {}", tool, target, dir),
                    None => format!("{} in {}", tool, dir),
                }
            }
            StepKind::Certificate { cert, .. } => format!("issue self-signed certificate {}", cert),
            StepKind::CopyTree { src, dest } => format!("copy {} to {}", src, dest),
            StepKind::Move { src, dest } => format!("move {} to {}", src, dest),
            StepKind::MakeDir { path } => format!("create directory {}", path),
            StepKind::Chown { path, user } => {
                format!("chown -R {} {}", user.as_deref().unwrap_or("{user}"), path)
            }
            StepKind::Chmod { path, mode } => format!("chmod {} {}", mode, path),
            StepKind::AppendLine { path, .. } => format!("append line to {}", path),
            StepKind::Download { url, dest, .. } => format!("download {} to {}", url, dest),
            StepKind::Exec { program, args, .. } => {
                let mut parts = vec![program.as_str()];
                parts.extend(args.iter().map(String::as_str));
                parts.join(" ")
            }
        }
    }
}

//! Built-in host checks used as preconditions and verifications.
//!
//! Paths are kept as templates and resolved against the [`HostContext`]
//! at evaluation time, so the same plan document works for any install
//! root and invoking user.
//!
//! YAML forms (one key per check):
//! - `path_exists: tools/peass`
//! - `file_has_line: { path: "{home}/.zsh_history", text: "cd /opt" }`
//! - `packages_installed: [git, cmake]`
//! - `all: [...]`, `any: [...]`, `not: {...}`
//! - `always` / `never`

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::adapters::CommandSpec;
use crate::context::HostContext;

use super::step::HostCheck;

/// Marker for the constant checks (deserializes from "always" / "never")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConstant {
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileText {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub path: String,
    /// Defaults to the invoking user
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSpec {
    pub path: String,
    /// Octal permission bits, e.g. "755"
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSpec {
    pub path: String,
    /// Hex-encoded SHA-256
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCheck {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A predicate over host state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Check {
    Constant(CheckConstant),

    PathExists { path_exists: String },

    DirNotEmpty { dir_not_empty: String },

    /// Some line of the file equals `text` exactly
    FileHasLine { file_has_line: FileText },

    /// The file contains `text` anywhere
    FileContains { file_contains: FileText },

    PackagesInstalled { packages_installed: Vec<String> },

    OwnedBy { owned_by: Ownership },

    ModeIs { mode_is: ModeSpec },

    GlobMatches { glob_matches: String },

    Sha256Matches { sha256_matches: DigestSpec },

    CommandSucceeds { command_succeeds: CommandCheck },

    All { all: Vec<Check> },

    Any { any: Vec<Check> },

    Not { not: Box<Check> },
}

impl Check {
    pub fn always() -> Self {
        Self::Constant(CheckConstant::Always)
    }

    pub fn never() -> Self {
        Self::Constant(CheckConstant::Never)
    }

    pub fn path_exists(path: impl Into<String>) -> Self {
        Self::PathExists {
            path_exists: path.into(),
        }
    }

    pub fn dir_not_empty(path: impl Into<String>) -> Self {
        Self::DirNotEmpty {
            dir_not_empty: path.into(),
        }
    }

    pub fn file_has_line(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self::FileHasLine {
            file_has_line: FileText {
                path: path.into(),
                text: text.into(),
            },
        }
    }

    pub fn packages_installed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::PackagesInstalled {
            packages_installed: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn owned_by(path: impl Into<String>, user: Option<String>) -> Self {
        Self::OwnedBy {
            owned_by: Ownership {
                path: path.into(),
                user,
            },
        }
    }

    pub fn mode_is(path: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::ModeIs {
            mode_is: ModeSpec {
                path: path.into(),
                mode: mode.into(),
            },
        }
    }

    pub fn sha256_matches(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self::Sha256Matches {
            sha256_matches: DigestSpec {
                path: path.into(),
                sha256: digest.into(),
            },
        }
    }

    pub fn all(checks: Vec<Check>) -> Self {
        Self::All { all: checks }
    }

    /// Combine with another check, flattening nested `all`s
    pub fn and(self, other: Check) -> Self {
        match self {
            Self::All { mut all } => {
                all.push(other);
                Self::All { all }
            }
            first => Self::All {
                all: vec![first, other],
            },
        }
    }

    async fn evaluate(&self, ctx: &HostContext) -> Result<bool> {
        match self {
            Self::Constant(CheckConstant::Always) => Ok(true),
            Self::Constant(CheckConstant::Never) => Ok(false),

            Self::PathExists { path_exists } => {
                let path = ctx.resolve_path(path_exists);
                Ok(tokio::fs::symlink_metadata(&path).await.is_ok())
            }

            Self::DirNotEmpty { dir_not_empty } => dir_not_empty_at(&ctx.resolve_path(dir_not_empty)).await,

            Self::FileHasLine { file_has_line } => {
                let text = ctx.expand(&file_has_line.text);
                match read_optional(&ctx.resolve_path(&file_has_line.path)).await? {
                    Some(content) => Ok(has_line(&content, text.as_bytes())),
                    None => Ok(false),
                }
            }

            Self::FileContains { file_contains } => {
                let text = ctx.expand(&file_contains.text);
                match read_optional(&ctx.resolve_path(&file_contains.path)).await? {
                    Some(content) => Ok(contains_bytes(&content, text.as_bytes())),
                    None => Ok(false),
                }
            }

            Self::PackagesInstalled { packages_installed } => {
                for name in packages_installed {
                    if !ctx.tools.packages.is_installed(name).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Self::OwnedBy { owned_by } => owned_by_check(ctx, owned_by).await,

            Self::ModeIs { mode_is } => {
                let wanted = parse_mode(&mode_is.mode)?;
                let path = ctx.resolve_path(&mode_is.path);
                match tokio::fs::metadata(&path).await {
                    Ok(metadata) => Ok(permission_bits(&metadata) == wanted),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
                }
            }

            Self::GlobMatches { glob_matches } => {
                let pattern = ctx.resolve_path(glob_matches);
                let pattern = pattern.to_string_lossy();
                let mut entries = glob::glob(&pattern)
                    .with_context(|| format!("Invalid glob pattern '{}'", pattern))?;
                Ok(entries.any(|entry| entry.is_ok()))
            }

            Self::Sha256Matches { sha256_matches } => {
                let path = ctx.resolve_path(&sha256_matches.path);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        let digest = hex::encode(Sha256::digest(&bytes));
                        Ok(digest.eq_ignore_ascii_case(sha256_matches.sha256.trim()))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
                }
            }

            Self::CommandSucceeds { command_succeeds } => {
                let spec = CommandSpec::new(ctx.expand(&command_succeeds.program))
                    .args(command_succeeds.args.iter().map(|a| ctx.expand(a)));
                let outcome = ctx
                    .tools
                    .commands
                    .run(&spec, &CancellationToken::new())
                    .await
                    .with_context(|| format!("Failed to run check command '{}'", spec.display()))?;
                Ok(outcome.success)
            }

            Self::All { all } => {
                for check in all {
                    if !check.check(ctx).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Self::Any { any } => {
                for check in any {
                    if check.check(ctx).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Self::Not { not } => Ok(!not.check(ctx).await?),
        }
    }
}

#[async_trait]
impl HostCheck for Check {
    async fn check(&self, ctx: &HostContext) -> Result<bool> {
        self.evaluate(ctx).await
    }

    fn describe(&self) -> String {
        match self {
            Self::Constant(CheckConstant::Always) => "always".to_string(),
            Self::Constant(CheckConstant::Never) => "never".to_string(),
            Self::PathExists { path_exists } => format!("{} exists", path_exists),
            Self::DirNotEmpty { dir_not_empty } => format!("{} is not empty", dir_not_empty),
            Self::FileHasLine { file_has_line } => {
                format!("{} has line '{}'", file_has_line.path, file_has_line.text)
            }
            Self::FileContains { file_contains } => {
                format!("{} contains '{}'", file_contains.path, file_contains.text)
            }
            Self::PackagesInstalled { packages_installed } => {
                format!("packages installed: {}", packages_installed.join(", "))
            }
            Self::OwnedBy { owned_by } => format!(
                "{} owned by {}",
                owned_by.path,
                owned_by.user.as_deref().unwrap_or("{user}")
            ),
            Self::ModeIs { mode_is } => format!("{} has mode {}", mode_is.path, mode_is.mode),
            Self::GlobMatches { glob_matches } => format!("{} matches", glob_matches),
            Self::Sha256Matches { sha256_matches } => {
                format!("{} has sha256 {}", sha256_matches.path, sha256_matches.sha256)
            }
            Self::CommandSucceeds { command_succeeds } => {
                format!("`{}` succeeds", command_succeeds.program)
            }
            Self::All { all } => all.iter().map(|c| c.describe()).collect::<Vec<_>>().join(" and "),
            Self::Any { any } => any.iter().map(|c| c.describe()).collect::<Vec<_>>().join(" or "),
            Self::Not { not } => format!("not ({})", not.describe()),
        }
    }
}

/// Parse an octal mode string ("755", "0755", "0o755")
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    let value = u32::from_str_radix(digits, 8)
        .with_context(|| format!("Invalid octal mode '{}'", mode))?;
    if value > 0o7777 {
        anyhow::bail!("Mode '{}' is out of range", mode);
    }
    Ok(value)
}

/// File contents as raw bytes; shell histories are not always UTF-8
async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Whether some line (`\n` or `\r\n` terminated) equals `line`
fn has_line(content: &[u8], line: &[u8]) -> bool {
    if content.is_empty() {
        return false;
    }
    let content = content.strip_suffix(b"\n").unwrap_or(content);
    content
        .split(|b| *b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .any(|l| l == line)
}

fn contains_bytes(content: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || content.windows(needle.len()).any(|window| window == needle)
}

async fn dir_not_empty_at(path: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?
        .is_some())
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
async fn owned_by_check(ctx: &HostContext, ownership: &Ownership) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    use crate::context::lookup_uid;

    let user = ownership.user.as_deref().unwrap_or(&ctx.user.name);
    let user = ctx.expand(user);
    let uid = lookup_uid(&user)?.with_context(|| format!("Unknown user '{}'", user))?;

    let path = ctx.resolve_path(&ownership.path);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) => Ok(metadata.uid() == uid),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

#[cfg(not(unix))]
async fn owned_by_check(_ctx: &HostContext, _ownership: &Ownership) -> Result<bool> {
    anyhow::bail!("Ownership checks are only supported on unix hosts")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::ResolvedConfig;
    use crate::context::{InvokingUser, Toolbox};

    fn ctx(root: &Path) -> HostContext {
        let config = ResolvedConfig::for_root(root);
        let user = InvokingUser {
            name: "operator".into(),
            home: root.join("home"),
        };
        HostContext::new(user, root, Toolbox::system(&config))
    }

    #[test]
    fn test_yaml_forms() {
        let yaml = r#"
all:
  - path_exists: tools/peass
  - never
  - file_has_line:
      path: "{home}/.bash_history"
      text: "cd /opt"
  - not:
      dir_not_empty: build
"#;
        let check: Check = serde_yaml::from_str(yaml).unwrap();
        let Check::All { all } = check else {
            panic!("expected all");
        };
        assert_eq!(all[0], Check::path_exists("tools/peass"));
        assert_eq!(all[1], Check::never());
        assert_eq!(all[2], Check::file_has_line("{home}/.bash_history", "cd /opt"));
        assert!(matches!(all[3], Check::Not { .. }));
    }

    #[tokio::test]
    async fn test_path_and_directory_checks() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::create_dir_all(temp.path().join("tools/empty")).unwrap();
        std::fs::create_dir_all(temp.path().join("tools/full")).unwrap();
        std::fs::write(temp.path().join("tools/full/README"), "x").unwrap();

        assert!(Check::path_exists("tools/empty").check(&ctx).await.unwrap());
        assert!(!Check::path_exists("tools/missing").check(&ctx).await.unwrap());
        assert!(!Check::dir_not_empty("tools/empty").check(&ctx).await.unwrap());
        assert!(Check::dir_not_empty("tools/full").check(&ctx).await.unwrap());
        assert!(!Check::dir_not_empty("tools/missing").check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_has_line_expands_placeholders() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::create_dir_all(temp.path().join("home")).unwrap();
        std::fs::write(
            temp.path().join("home/.zsh_history"),
            format!("ls\ncd {}/tools\n", temp.path().display()),
        )
        .unwrap();

        let present = Check::file_has_line("{home}/.zsh_history", "cd {root}/tools");
        let partial = Check::file_has_line("{home}/.zsh_history", "cd");
        let missing_file = Check::file_has_line("{home}/.bash_history", "ls");

        assert!(present.check(&ctx).await.unwrap());
        assert!(!partial.check(&ctx).await.unwrap());
        assert!(!missing_file.check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_checks_tolerate_non_utf8_content() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::create_dir_all(temp.path().join("home")).unwrap();
        std::fs::write(temp.path().join("home/.zsh_history"), b"ls\r\n\x83\xa9 caf\xe9\nexport EDITOR=vim\n").unwrap();

        let history = "{home}/.zsh_history";
        assert!(Check::file_has_line(history, "ls").check(&ctx).await.unwrap());
        assert!(Check::file_has_line(history, "export EDITOR=vim").check(&ctx).await.unwrap());
        assert!(!Check::file_has_line(history, "export PATH=/opt/bin").check(&ctx).await.unwrap());

        let contains = |text: &str| Check::FileContains {
            file_contains: FileText {
                path: history.to_string(),
                text: text.to_string(),
            },
        };
        assert!(contains("EDITOR").check(&ctx).await.unwrap());
        assert!(!contains("PAGER").check(&ctx).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owned_by_current_user() {
        use nix::unistd::{Uid, User};

        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::create_dir_all(temp.path().join("tools")).unwrap();
        let me = User::from_uid(Uid::current()).unwrap().unwrap().name;

        assert!(Check::owned_by("tools", Some(me.clone())).check(&ctx).await.unwrap());
        assert!(!Check::owned_by("missing", Some(me)).check(&ctx).await.unwrap());
        assert!(Check::owned_by("tools", Some("no-such-user-xyz".into()))
            .check(&ctx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sha256_check() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::write(temp.path().join("payload"), "hello").unwrap();

        let good = Check::sha256_matches(
            "payload",
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        );
        let bad = Check::sha256_matches("payload", "00");
        assert!(good.check(&ctx).await.unwrap());
        assert!(!bad.check(&ctx).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mode_check() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        let file = temp.path().join("run.sh");
        std::fs::write(&file, "").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(Check::mode_is("run.sh", "755").check(&ctx).await.unwrap());
        assert!(!Check::mode_is("run.sh", "0700").check(&ctx).await.unwrap());
        assert!(Check::mode_is("run.sh", "not-octal").check(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_combinators() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());

        let all = Check::always().and(Check::never());
        assert!(!all.check(&ctx).await.unwrap());

        let any = Check::Any {
            any: vec![Check::never(), Check::always()],
        };
        assert!(any.check(&ctx).await.unwrap());

        let not = Check::Not {
            not: Box::new(Check::path_exists("nothing")),
        };
        assert!(not.check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_glob_check() {
        let temp = TempDir::new().unwrap();
        let ctx = ctx(temp.path());
        std::fs::create_dir_all(temp.path().join("build")).unwrap();
        std::fs::write(temp.path().join("build/libtool.so"), "").unwrap();

        let hit = Check::GlobMatches {
            glob_matches: "build/*.so".into(),
        };
        let miss = Check::GlobMatches {
            glob_matches: "build/*.a".into(),
        };
        assert!(hit.check(&ctx).await.unwrap());
        assert!(!miss.check(&ctx).await.unwrap());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o644").unwrap(), 0o644);
        assert_eq!(parse_mode("0600").unwrap(), 0o600);
        assert!(parse_mode("99").is_err());
        assert!(parse_mode("77777").is_err());
    }

    #[test]
    fn test_describe() {
        let check = Check::path_exists("tools/a").and(Check::never());
        assert_eq!(check.describe(), "tools/a exists and never");
    }
}

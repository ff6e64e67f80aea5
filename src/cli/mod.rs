//! Command-line interface for provision.
//!
//! Provides commands for applying plans (or forecasting them with
//! `--dry-run`), validating plan documents, listing available plans and
//! showing the resolved configuration.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use crate::config::{load_config, ResolvedConfig};
use crate::context::HostContext;
use crate::core::{Orchestrator, Plan};
use crate::manifest::PlanDocument;

pub mod lock;

use lock::RunLock;

/// provision - Declarative, idempotent host provisioning
#[derive(Parser, Debug)]
#[command(name = "provision")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a plan to this host
    Apply {
        /// Plan name (looks for <plans_dir>/<name>.yaml) or path to a plan file
        #[arg(short, long)]
        plan: String,

        /// Evaluate checks only; never run actions
        #[arg(long)]
        dry_run: bool,

        /// Maximum steps in flight (default from config, 1 = sequential)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Check a plan document and print its execution order
    Validate {
        /// Plan name or path to a plan file
        #[arg(short, long)]
        plan: String,
    },

    /// List plan documents in the plans directory
    Plans,

    /// Show the resolved configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let config = load_config()?;

        match self.command {
            Commands::Apply {
                plan,
                dry_run,
                jobs,
                format,
            } => apply(&config, &plan, dry_run, jobs, format).await,
            Commands::Validate { plan } => {
                validate(&config, &plan)?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::Plans => {
                list_plans(&config)?;
                Ok(ExitCode::SUCCESS)
            }
            Commands::Config => {
                show_config(&config)?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Map a `--plan` value to a file: explicit paths are used as-is
pub fn plan_location(value: &str, config: &ResolvedConfig) -> PathBuf {
    let looks_like_path = value.ends_with(".yaml")
        || value.ends_with(".yml")
        || value.contains('/')
        || value.contains(std::path::MAIN_SEPARATOR);

    if looks_like_path {
        PathBuf::from(value)
    } else {
        config.plan_path(value)
    }
}

fn load_document(value: &str, config: &ResolvedConfig) -> Result<PlanDocument> {
    let path = plan_location(value, config);
    if !path.exists() {
        anyhow::bail!("Plan '{}' not found. Looked for:\n  - {}", value, path.display());
    }
    PlanDocument::from_file(&path)
}

fn build_plan(value: &str, config: &ResolvedConfig, ctx: &HostContext) -> Result<Plan> {
    let document = load_document(value, config)?;
    document.compile(ctx, config.default_timeout)
}

async fn apply(
    config: &ResolvedConfig,
    plan_name: &str,
    dry_run: bool,
    jobs: Option<usize>,
    format: OutputFormat,
) -> Result<ExitCode> {
    let ctx = Arc::new(HostContext::from_config(config)?);
    let plan = Arc::new(build_plan(plan_name, config, &ctx)?);

    let orchestrator = Orchestrator::new(ctx.clone())
        .with_jobs(jobs.unwrap_or(config.concurrency.jobs))
        .with_limits(config.concurrency.limits);

    if dry_run {
        let forecast = orchestrator.dry_run(&plan).await;
        match format {
            OutputFormat::Text => print!("{}", forecast.render_text()),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&forecast).context("Failed to serialize forecast")?
            ),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let _lock = RunLock::acquire(&config.lock_path())?;
    info!(
        plan = %plan.name(),
        user = %ctx.user.name,
        root = %ctx.install_root.display(),
        "Applying plan"
    );

    let token = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });

    let report = orchestrator.run(plan).await;
    interrupt.abort();

    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        ),
    }

    Ok(ExitCode::from(report.exit_code()))
}

fn validate(config: &ResolvedConfig, plan_name: &str) -> Result<()> {
    let ctx = HostContext::from_config(config)?;
    let plan = build_plan(plan_name, config, &ctx)?;

    println!("Plan '{}' is valid ({} steps)", plan.name(), plan.len());
    if !plan.description().is_empty() {
        println!("{}", plan.description());
    }
    println!();
    println!("{:<4} {:<28} {:<8} {}", "#", "STEP", "CLASS", "ACTION");
    println!("{}", "-".repeat(75));

    for (position, step) in plan.ordered_steps().enumerate() {
        println!(
            "{:<4} {:<28} {:<8} {}",
            position + 1,
            step.id,
            step.class.to_string(),
            step.action.describe()
        );
        if !step.depends_on.is_empty() {
            let deps: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
            println!("{:<4} {:<28} after: {}", "", "", deps.join(", "));
        }
    }

    Ok(())
}

fn plan_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read plans directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn list_plans(config: &ResolvedConfig) -> Result<()> {
    let files = plan_files(&config.plans_dir)?;

    if files.is_empty() {
        println!("No plans found in {}", config.plans_dir.display());
        return Ok(());
    }

    println!("{:<20} {:<7} {}", "PLAN", "STEPS", "DESCRIPTION");
    println!("{}", "-".repeat(75));

    for path in &files {
        match PlanDocument::from_file(path) {
            Ok(doc) => println!("{:<20} {:<7} {}", doc.name, doc.steps.len(), doc.description),
            Err(e) => {
                let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
                println!("{:<20} {:<7} (invalid: {:#})", stem, "-", e);
            }
        }
    }

    println!("\nTotal: {} plan(s) in {}", files.len(), config.plans_dir.display());
    Ok(())
}

fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!(
        "{}",
        serde_yaml::to_string(config).context("Failed to render configuration")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plan_location() {
        let config = ResolvedConfig::for_root("/opt/kit");

        assert_eq!(
            plan_location("toolkit", &config),
            PathBuf::from("/opt/kit/plans/toolkit.yaml")
        );
        assert_eq!(plan_location("./custom.yml", &config), PathBuf::from("./custom.yml"));
        assert_eq!(plan_location("other.yaml", &config), PathBuf::from("other.yaml"));
        assert_eq!(plan_location("/srv/plans/x", &config), PathBuf::from("/srv/plans/x"));
    }

    #[test]
    fn test_missing_plan_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::for_root(temp.path());

        let err = load_document("absent", &config).unwrap_err();
        assert!(err.to_string().contains("Plan 'absent' not found"));
    }

    #[test]
    fn test_plan_files_filters_extensions() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("b.yaml"), "").unwrap();
        std::fs::write(temp.path().join("a.yml"), "").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "").unwrap();

        let files = plan_files(temp.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yml", "b.yaml"]);
        assert!(plan_files(&temp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_cli_parses_apply() {
        let cli = Cli::parse_from(["provision", "apply", "--plan", "toolkit", "--dry-run", "-j", "4"]);
        match cli.command {
            Commands::Apply {
                plan,
                dry_run,
                jobs,
                format,
            } => {
                assert_eq!(plan, "toolkit");
                assert!(dry_run);
                assert_eq!(jobs, Some(4));
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}

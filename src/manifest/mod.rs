//! YAML plan documents.
//!
//! A document lists steps by `kind`; compiling it fills in each kind's
//! default checks, class, retry policy and lock tags, then hands the steps
//! to [`Plan::new`] for validation and ordering.

pub mod kinds;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::HostContext;
use crate::core::{Check, ConcurrencyClass, FailurePolicy, Plan, RetryPolicy, Step};

pub use kinds::{BuildTool, KindAction, StepKind, PACKAGE_MANAGER_LOCK};

/// Top-level plan document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<StepDocument>,
}

/// One step as written in a plan document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDocument {
    pub id: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Replaces the kind's default precondition
    #[serde(default)]
    pub precondition: Option<Check>,

    /// Replaces the kind's default verification
    #[serde(default)]
    pub verify: Option<Check>,

    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub class: Option<ConcurrencyClass>,

    /// Extra lock tags on top of the kind's own
    #[serde(default)]
    pub locks: Vec<String>,

    #[serde(flatten)]
    pub kind: StepKind,
}

impl PlanDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse plan document")
    }

    /// Load a plan document from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))
    }

    /// Build a validated plan for a host
    pub fn compile(&self, ctx: &HostContext, default_timeout: Option<Duration>) -> Result<Plan> {
        let steps = self
            .steps
            .iter()
            .map(|doc| doc.compile(ctx, default_timeout))
            .collect::<Result<Vec<_>>>()?;

        let plan = Plan::new(&self.name, steps)
            .with_context(|| format!("Invalid plan '{}'", self.name))?;

        Ok(plan.with_description(&self.description))
    }
}

impl StepDocument {
    fn compile(&self, ctx: &HostContext, default_timeout: Option<Duration>) -> Result<Step> {
        self.kind
            .validate()
            .map_err(|reason| anyhow::anyhow!("Step '{}': {}", self.id, reason))?;

        let mut step = Step::from_arc(&self.id, Arc::new(KindAction::new(self.kind.clone())))
            .depends_on(self.depends_on.iter().cloned())
            .on_failure(self.on_failure)
            .retry(self.retry.clone().unwrap_or_else(|| self.kind.default_retry()))
            .class(self.class.unwrap_or_else(|| self.kind.default_class()));

        if let Some(ref description) = self.description {
            step = step.description(description);
        }
        if let Some(check) = self.precondition.clone().or_else(|| self.kind.default_precondition()) {
            step = step.precondition(check);
        }
        if let Some(check) = self.verify.clone().or_else(|| self.kind.default_verify()) {
            step = step.verify(check);
        }
        if let Some(limit) = self.timeout_seconds.map(Duration::from_secs).or(default_timeout) {
            step = step.timeout(limit);
        }
        for tag in self.kind.default_locks(ctx).into_iter().chain(self.locks.iter().cloned()) {
            step = step.lock(tag);
        }

        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::ResolvedConfig;
    use crate::context::{InvokingUser, Toolbox};
    use crate::core::InvalidPlanError;

    const TOOLKIT: &str = r#"
name: toolkit
description: Offensive tooling workstation
steps:
  - id: base-packages
    kind: packages
    names: [git, build-essential, cmake]

  - id: clone-peass
    kind: clone
    url: https://github.com/peass-ng/PEASS-ng.git
    dest: tools/peass
    depends_on: [base-packages]
    on_failure: continue_independent

  - id: build-tool
    kind: build
    dir: tools/peass
    tool: cmake
    creates: tools/peass/build/out
    depends_on: [clone-peass]
    timeout_seconds: 600

  - id: history
    kind: append_line
    path: "{home}/.zsh_history"
    line: "cd {root}/tools"

  - id: perms
    kind: chmod
    path: tools/peass
    mode: "0755"
    depends_on: [clone-peass]
    retry:
      max_attempts: 2
      delay_ms: 10
"#;

    fn ctx() -> HostContext {
        let config = ResolvedConfig::for_root("/opt/kit");
        let user = InvokingUser {
            name: "operator".into(),
            home: PathBuf::from("/home/operator"),
        };
        HostContext::new(user, "/opt/kit", Toolbox::system(&config))
    }

    #[test]
    fn test_parse_document() {
        let doc = PlanDocument::from_yaml(TOOLKIT).unwrap();
        assert_eq!(doc.name, "toolkit");
        assert_eq!(doc.steps.len(), 5);

        let clone = &doc.steps[1];
        assert_eq!(clone.on_failure, FailurePolicy::ContinueIndependent);
        assert_eq!(clone.depends_on, vec!["base-packages".to_string()]);
        assert!(matches!(clone.kind, StepKind::Clone { ref dest, .. } if dest == "tools/peass"));

        assert!(matches!(doc.steps[2].kind, StepKind::Build { tool: BuildTool::Cmake, .. }));
    }

    #[test]
    fn test_compile_applies_kind_defaults() {
        let plan = PlanDocument::from_yaml(TOOLKIT).unwrap().compile(&ctx(), None).unwrap();

        let packages = plan.get_step("base-packages").unwrap();
        assert_eq!(packages.class, ConcurrencyClass::Network);
        assert_eq!(packages.retry.max_attempts, 3);
        assert!(packages.locks.contains(PACKAGE_MANAGER_LOCK));
        assert!(packages.precondition.is_some());

        let clone = plan.get_step("clone-peass").unwrap();
        assert!(clone.locks.contains("/opt/kit/tools/peass"));

        let build = plan.get_step("build-tool").unwrap();
        assert_eq!(build.class, ConcurrencyClass::Build);
        assert_eq!(build.timeout, Some(Duration::from_secs(600)));

        let perms = plan.get_step("perms").unwrap();
        assert_eq!(perms.retry.max_attempts, 2);
        assert_eq!(perms.retry.delay_ms, 10);

        let history = plan.get_step("history").unwrap();
        assert!(history.locks.contains("/home/operator/.zsh_history"));
    }

    #[test]
    fn test_default_timeout_fills_gaps() {
        let plan = PlanDocument::from_yaml(TOOLKIT)
            .unwrap()
            .compile(&ctx(), Some(Duration::from_secs(120)))
            .unwrap();

        assert_eq!(plan.get_step("history").unwrap().timeout, Some(Duration::from_secs(120)));
        assert_eq!(plan.get_step("build-tool").unwrap().timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_order_follows_dependencies() {
        let plan = PlanDocument::from_yaml(TOOLKIT).unwrap().compile(&ctx(), None).unwrap();
        let order: Vec<&str> = plan.ordered_steps().map(|s| s.id.as_str()).collect();

        let pos = |id: &str| order.iter().position(|s| *s == id).unwrap();
        assert!(pos("base-packages") < pos("clone-peass"));
        assert!(pos("clone-peass") < pos("build-tool"));
        assert!(pos("clone-peass") < pos("perms"));
    }

    #[test]
    fn test_explicit_checks_override_defaults() {
        let yaml = r#"
name: custom
steps:
  - id: tool
    kind: exec
    program: pip3
    args: [install, impacket]
    precondition:
      command_succeeds:
        program: python3
        args: ["-c", "import impacket"]
"#;
        let doc = PlanDocument::from_yaml(yaml).unwrap();
        assert!(matches!(doc.steps[0].precondition, Some(Check::CommandSucceeds { .. })));

        let plan = doc.compile(&ctx(), None).unwrap();
        assert!(plan.get_step("tool").unwrap().precondition.is_some());
        assert!(plan.get_step("tool").unwrap().verify.is_none());
    }

    #[test]
    fn test_cycle_is_reported() {
        let yaml = r#"
name: loop
steps:
  - id: a
    kind: make_dir
    path: a
    depends_on: [b]
  - id: b
    kind: make_dir
    path: b
    depends_on: [a]
"#;
        let err = PlanDocument::from_yaml(yaml).unwrap().compile(&ctx(), None).unwrap_err();
        let invalid = err.downcast_ref::<InvalidPlanError>().expect("plan error");
        assert!(matches!(invalid, InvalidPlanError::Cycle { .. }));
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let yaml = "name: x\nsteps:\n  - id: a\n    kind: teleport\n";
        assert!(PlanDocument::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_mode_fails_compile() {
        let yaml = "name: x\nsteps:\n  - id: a\n    kind: chmod\n    path: a\n    mode: \"999\"\n";
        let err = PlanDocument::from_yaml(yaml).unwrap().compile(&ctx(), None).unwrap_err();
        assert!(err.to_string().contains("Step 'a'"));
    }
}

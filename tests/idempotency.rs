//! Idempotency Integration Tests
//!
//! A plan document applied twice to the same host must do its work once:
//! the second run ends with every step skipped and no further tool calls.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use provision::core::Orchestrator;
use provision::domain::{ReportStatus, SkipReason, StepStatus};
use provision::manifest::PlanDocument;

use common::TestHost;

const WORKSTATION: &str = r#"
name: workstation
description: Tools, certificates and shell setup
steps:
  - id: base-packages
    kind: packages
    names: [git, cmake, python3-pip]

  - id: peass
    kind: clone
    url: https://github.com/peass-ng/PEASS-ng.git
    dest: tools/peass
    depends_on: [base-packages]

  - id: build-peass
    kind: build
    dir: tools/peass
    tool: make
    creates: tools/peass/README.md
    depends_on: [peass]
    verify: always

  - id: listener-cert
    kind: certificate
    subject: "/CN=listener"
    key: certs/listener.key
    cert: certs/listener.crt

  - id: chisel
    kind: download
    url: https://example.com/chisel.gz
    dest: bin/chisel.gz

  - id: history
    kind: append_line
    path: "{home}/.zsh_history"
    line: "cd {root}/tools"

  - id: scratch
    kind: make_dir
    path: scratch/loot
"#;

#[tokio::test]
async fn test_second_run_skips_everything() {
    let host = TestHost::new();
    let document = PlanDocument::from_yaml(WORKSTATION).unwrap();
    let plan = Arc::new(document.compile(&host.ctx, None).unwrap());

    let first = Orchestrator::new(host.ctx.clone()).run(plan.clone()).await;
    assert_eq!(first.status, ReportStatus::Success, "{}", first.render_text());
    let calls_after_first = host.log.len();
    let files_after_first = host.file_log.len();
    assert!(calls_after_first >= 5, "calls: {:?}", host.log.calls());

    // The fake builder produces nothing; leave the artifact a real build would
    std::fs::write(host.root().join("tools/peass/README.md"), "built").unwrap();

    let second = Orchestrator::new(host.ctx.clone()).run(plan).await;
    assert_eq!(second.status, ReportStatus::Success);
    for result in &second.results {
        assert_eq!(
            result.status,
            StepStatus::skipped(SkipReason::AlreadySatisfied),
            "step '{}' should be skipped",
            result.step_id
        );
    }
    assert_eq!(host.log.len(), calls_after_first, "second run must not call any tool");
    assert_eq!(host.file_log.len(), files_after_first, "second run must not touch the filesystem");
}

#[tokio::test]
async fn test_append_line_is_not_duplicated() {
    let host = TestHost::new();
    let yaml = r#"
name: shell
steps:
  - id: history
    kind: append_line
    path: "{home}/.zsh_history"
    line: "export PATH={root}/bin:$PATH"
"#;
    let plan = Arc::new(PlanDocument::from_yaml(yaml).unwrap().compile(&host.ctx, None).unwrap());

    for _ in 0..3 {
        let report = Orchestrator::new(host.ctx.clone()).run(plan.clone()).await;
        assert_eq!(report.status, ReportStatus::Success);
    }

    let content = std::fs::read_to_string(host.home().join(".zsh_history")).unwrap();
    let expected = format!("export PATH={}/bin:$PATH", host.root().display());
    assert_eq!(content.lines().filter(|l| *l == expected).count(), 1);
}

#[tokio::test]
async fn test_clone_clears_stale_destination() {
    let host = TestHost::new();
    let stale = host.root().join("tools/seclists");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("partial.txt"), "left over from an interrupted run").unwrap();

    let yaml = r#"
name: lists
steps:
  - id: seclists
    kind: clone
    url: https://github.com/danielmiessler/SecLists.git
    dest: tools/seclists
"#;
    let plan = Arc::new(PlanDocument::from_yaml(yaml).unwrap().compile(&host.ctx, None).unwrap());
    let report = Orchestrator::new(host.ctx.clone()).run(plan).await;

    assert_eq!(report.status, ReportStatus::Success);
    assert!(stale.join(".git").is_dir());
    assert!(!stale.join("partial.txt").exists());
}

#[tokio::test]
async fn test_clone_retries_transient_failures() {
    let host = TestHost::new();
    host.vcs.failures_left.store(2, Ordering::SeqCst);

    let yaml = r#"
name: flaky
steps:
  - id: tool
    kind: clone
    url: https://github.com/example/tool.git
    dest: tools/tool
    retry:
      max_attempts: 3
      delay_ms: 10
"#;
    let plan = Arc::new(PlanDocument::from_yaml(yaml).unwrap().compile(&host.ctx, None).unwrap());
    let report = Orchestrator::new(host.ctx.clone()).run(plan).await;

    let result = report.result("tool").unwrap();
    assert_eq!(result.status, StepStatus::Succeeded);
    assert_eq!(result.attempts, 3);
    assert_eq!(host.log.len(), 3);
}

#[tokio::test]
async fn test_dry_run_on_fresh_host_touches_nothing() {
    let host = TestHost::new();
    let plan = PlanDocument::from_yaml(WORKSTATION)
        .unwrap()
        .compile(&host.ctx, None)
        .unwrap();

    let forecast = Orchestrator::new(host.ctx.clone()).dry_run(&plan).await;

    assert_eq!(forecast.steps.len(), plan.len());
    assert_eq!(host.log.len(), 0);
    assert!(!host.root().join("scratch").exists());
    assert!(!host.home().join(".zsh_history").exists());
}

#[tokio::test]
async fn test_copy_tree_replaces_interrupted_copy() {
    let host = TestHost::new();
    let src = host.root().join("staging/wordlists");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("common.txt"), "admin\nroot\n").unwrap();

    // A previous run was stopped halfway through the copy
    let leftover = host.root().join("share/wordlists.part");
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::write(leftover.join("common.txt"), "adm").unwrap();

    let yaml = r#"
name: wordlists
steps:
  - id: wordlists
    kind: copy_tree
    src: staging/wordlists
    dest: share/wordlists
"#;
    let plan = Arc::new(PlanDocument::from_yaml(yaml).unwrap().compile(&host.ctx, None).unwrap());

    let first = Orchestrator::new(host.ctx.clone()).run(plan.clone()).await;
    assert_eq!(first.status_of("wordlists"), Some(&StepStatus::Succeeded));
    let dest = host.root().join("share/wordlists");
    assert_eq!(std::fs::read_to_string(dest.join("common.txt")).unwrap(), "admin\nroot\n");
    assert!(!leftover.exists());

    let second = Orchestrator::new(host.ctx.clone()).run(plan).await;
    assert_eq!(
        second.status_of("wordlists"),
        Some(&StepStatus::skipped(SkipReason::AlreadySatisfied))
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_chown_to_invoking_user_is_idempotent() {
    let host = TestHost::new();
    std::fs::create_dir_all(host.root().join("tools/peass")).unwrap();
    std::fs::write(host.root().join("tools/peass/linpeas.sh"), "#!/bin/sh\n").unwrap();
    let user = common::current_user();

    // Force the action once so the default verification runs after it
    let forced = format!(
        r#"
name: hand-over
steps:
  - id: hand-over
    kind: chown
    path: tools
    user: {user}
    precondition: never
"#
    );
    let plan = PlanDocument::from_yaml(&forced).unwrap().compile(&host.ctx, None).unwrap();
    assert!(plan.get_step("hand-over").unwrap().verify.is_some());

    let first = Orchestrator::new(host.ctx.clone()).run(Arc::new(plan)).await;
    assert_eq!(first.status, ReportStatus::Success, "{}", first.render_text());
    assert_eq!(first.status_of("hand-over"), Some(&StepStatus::Succeeded));
    let calls = host.file_log.calls();
    assert!(
        calls.iter().any(|c| c.starts_with(&format!("chown {} ", user))),
        "calls: {:?}",
        calls
    );

    let declared = format!(
        r#"
name: hand-over
steps:
  - id: hand-over
    kind: chown
    path: tools
    user: {user}
"#
    );
    let plan = PlanDocument::from_yaml(&declared).unwrap().compile(&host.ctx, None).unwrap();
    let second = Orchestrator::new(host.ctx.clone()).run(Arc::new(plan)).await;

    assert_eq!(
        second.status_of("hand-over"),
        Some(&StepStatus::skipped(SkipReason::AlreadySatisfied))
    );
    assert_eq!(host.file_log.len(), calls.len(), "second run must not touch the filesystem");
}

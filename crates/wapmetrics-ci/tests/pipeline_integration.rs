//! Orchestrator integration tests with in-memory tools.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use wapmetrics_ci::bundle::{FINDINGS_FILE, MANIFEST_FILE, SUMMARY_FILE};
use wapmetrics_ci::{
    list_bundle, FailurePolicy, MeasurementTool, MemorySink, Orchestrator, PluginCapabilities,
    PluginDescriptor, RunContext, RunOutcome, RunRequest, SchedulingMode, TargetInputs,
    ToolOutput, ToolRegistry,
};
use wapmetrics_core::{
    parse_config, Finding, Manifest, NormalizedConfig, Provenance, Severity, ToolStatus,
    WapmError, STICKY_MARKER,
};

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Clean,
    HighFinding,
    MediumFinding,
    Fail,
    NotApplicable,
    Sleep(u64),
}

/// Records what it saw and how many invocations overlapped.
#[derive(Default)]
struct Probe {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    seen_base_urls: Mutex<Vec<Option<String>>>,
    seen_configs: Mutex<Vec<Map<String, Value>>>,
}

struct FakeTool {
    name: &'static str,
    behavior: Behavior,
    capabilities: PluginCapabilities,
    probe: Arc<Probe>,
}

#[async_trait]
impl MeasurementTool for FakeTool {
    fn init(&self) -> anyhow::Result<PluginDescriptor> {
        Ok(PluginDescriptor::new(self.name, "0.0.1")
            .with_capabilities(self.capabilities)
            .with_default("level", json!("default"))
            .with_default("retries", json!(1)))
    }

    async fn detect(&self, _ctx: &RunContext) -> anyhow::Result<bool> {
        Ok(self.behavior != Behavior::NotApplicable)
    }

    async fn run(&self, ctx: &RunContext) -> anyhow::Result<ToolOutput> {
        self.probe.runs.fetch_add(1, Ordering::SeqCst);
        self.probe
            .seen_base_urls
            .lock()
            .unwrap()
            .push(ctx.target.base_url.clone());
        self.probe.seen_configs.lock().unwrap().push(ctx.config.clone());

        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(now, Ordering::SeqCst);
        if let Behavior::Sleep(ms) = self.behavior {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        std::fs::write(ctx.scratch_dir.join("raw.txt"), self.name)?;
        let finding = |severity| {
            Finding::new(self.name, severity, "Synthetic issue", "detail").with_route("/")
        };
        match self.behavior {
            Behavior::HighFinding => Ok(ToolOutput::new(vec![finding(Severity::High)])),
            Behavior::MediumFinding => Ok(ToolOutput::new(vec![finding(Severity::Medium)])),
            Behavior::Fail => anyhow::bail!("browser crashed"),
            _ => Ok(ToolOutput::default().with_artifact(ctx.scratch_dir.join("raw.txt"))),
        }
    }
}

fn register(
    registry: &mut ToolRegistry,
    name: &'static str,
    behavior: Behavior,
    capabilities: PluginCapabilities,
) -> Arc<Probe> {
    let probe = Arc::new(Probe::default());
    register_with_probe(registry, name, behavior, capabilities, probe.clone());
    probe
}

fn register_with_probe(
    registry: &mut ToolRegistry,
    name: &'static str,
    behavior: Behavior,
    capabilities: PluginCapabilities,
    probe: Arc<Probe>,
) {
    registry
        .register(name, move || {
            Arc::new(FakeTool {
                name,
                behavior,
                capabilities,
                probe: probe.clone(),
            }) as Arc<dyn MeasurementTool>
        })
        .unwrap();
}

/// Register a tool whose descriptor name differs from its registry name.
fn register_alias(
    registry: &mut ToolRegistry,
    registered_as: &str,
    descriptor_name: &'static str,
) -> Arc<Probe> {
    let probe = Arc::new(Probe::default());
    let shared = probe.clone();
    registry
        .register(registered_as, move || {
            Arc::new(FakeTool {
                name: descriptor_name,
                behavior: Behavior::Clean,
                capabilities: PluginCapabilities::default(),
                probe: shared.clone(),
            }) as Arc<dyn MeasurementTool>
        })
        .unwrap();
    probe
}

fn parallel_caps() -> PluginCapabilities {
    PluginCapabilities {
        parallel_safe: true,
        ..PluginCapabilities::default()
    }
}

fn url_caps() -> PluginCapabilities {
    PluginCapabilities {
        needs_base_url: true,
        ..PluginCapabilities::default()
    }
}

fn config() -> NormalizedConfig {
    NormalizedConfig::new("https://x.test", &["/", "/pricing"])
}

fn request(work: &Path) -> RunRequest {
    RunRequest::new(config(), work.join("run"))
}

#[tokio::test]
async fn test_single_high_finding_fails_gate() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "perf", Behavior::HighFinding, PluginCapabilities::default());
    register(&mut registry, "a11y", Behavior::MediumFinding, PluginCapabilities::default());

    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["perf", "a11y"]))
        .await
        .unwrap();

    assert!(!report.passed());
    assert_eq!(report.outcome(), RunOutcome::GateFailed);
    assert_eq!(report.verdict.findings.len(), 2);
    assert_eq!(report.verdict.blocking, 1);
    assert!(report.status_body.starts_with(STICKY_MARKER));
    assert!(report.status_body.contains("**Status:** Failing"));
    assert!(report.status_body.contains("### perf\n\n_1 findings_"));

    let manifest = Manifest::read(&report.work_dir.join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.tools, vec!["perf".to_string(), "a11y".to_string()]);
    assert_eq!(manifest.routes, vec!["https://x.test/", "https://x.test/pricing"]);

    let findings: Vec<Finding> = serde_json::from_str(
        &std::fs::read_to_string(report.work_dir.join(FINDINGS_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].source_tool, "perf");
    assert!(report.work_dir.join(SUMMARY_FILE).is_file());
}

#[tokio::test]
async fn test_medium_findings_pass() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "a11y", Behavior::MediumFinding, PluginCapabilities::default());

    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["a11y"]))
        .await
        .unwrap();
    assert!(report.passed());
    assert_eq!(report.outcome(), RunOutcome::Passed);
    assert!(report.status_body.contains("**Status:** Passing"));
}

#[tokio::test]
async fn test_tool_failure_is_attributed_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let broken = register(&mut registry, "broken", Behavior::Fail, PluginCapabilities::default());
    let healthy = register(&mut registry, "healthy", Behavior::Clean, PluginCapabilities::default());

    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["broken", "healthy"]))
        .await
        .unwrap();

    assert_eq!(broken.runs.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.results.len(), 2);
    match &report.results[0].status {
        ToolStatus::Failed { reason } => assert!(reason.contains("browser crashed")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.results[1].status, ToolStatus::Completed);
    assert_eq!(report.verdict.failed_tools, vec!["broken".to_string()]);
    assert!(report.status_body.contains("### broken\n\n**Tool failed:** browser crashed"));
    assert_eq!(report.outcome(), RunOutcome::Passed);
}

#[tokio::test]
async fn test_every_tool_failing_is_run_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "broken", Behavior::Fail, PluginCapabilities::default());

    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["broken"]))
        .await
        .unwrap();
    assert_eq!(report.outcome(), RunOutcome::RunError);
}

#[tokio::test]
async fn test_abort_policy_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "broken", Behavior::Fail, PluginCapabilities::default());
    let later = register(&mut registry, "later", Behavior::Clean, PluginCapabilities::default());

    let req = request(dir.path())
        .with_tools(["broken", "later"])
        .with_failure_policy(FailurePolicy::Abort);
    let work = req.work_dir.clone();
    let err = Orchestrator::new(registry).run(req).await.unwrap_err();

    assert!(matches!(err, WapmError::ToolExecutionFailed { ref tool, .. } if tool == "broken"));
    assert_eq!(later.runs.load(Ordering::SeqCst), 0);
    assert!(!work.join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn test_unknown_tool_rejected_before_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let known = register(&mut registry, "known", Behavior::Clean, PluginCapabilities::default());

    let req = request(dir.path()).with_tools(["known", "pa11y"]);
    let work = req.work_dir.clone();
    let err = Orchestrator::new(registry).run(req).await.unwrap_err();

    assert!(matches!(err, WapmError::UnknownTool(ref name) if name == "pa11y"));
    assert!(err.is_fatal_before_tools());
    assert_eq!(known.runs.load(Ordering::SeqCst), 0);
    assert!(!work.exists());
}

#[tokio::test]
async fn test_no_tools_passes_trivially() {
    let dir = tempfile::tempdir().unwrap();
    let report = Orchestrator::new(ToolRegistry::new())
        .run(request(dir.path()))
        .await
        .unwrap();
    assert!(report.passed());
    assert!(report.verdict.findings.is_empty());
    assert_eq!(report.outcome(), RunOutcome::Passed);
    assert!(report.work_dir.join(MANIFEST_FILE).is_file());
}

#[tokio::test]
async fn test_enabled_plugins_come_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let on = register(&mut registry, "on", Behavior::Clean, PluginCapabilities::default());
    let off = register(&mut registry, "off", Behavior::Clean, PluginCapabilities::default());

    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "routes": ["/"],
            "plugins": [
                { "name": "on", "config": { "level": "persisted" } },
                { "name": "off", "enabled": false }
            ]
        }"#,
    )
    .unwrap();
    let mut run_layer = Map::new();
    run_layer.insert("retries".to_string(), json!(5));
    let req = RunRequest::new(config, dir.path().join("run")).with_tool_override("on", run_layer);

    let report = Orchestrator::new(registry).run(req).await.unwrap();
    assert_eq!(report.tools, vec!["on".to_string()]);
    assert_eq!(off.runs.load(Ordering::SeqCst), 0);

    let seen = on.seen_configs.lock().unwrap();
    assert_eq!(seen[0]["level"], json!("persisted"));
    assert_eq!(seen[0]["retries"], json!(5));
}

#[tokio::test]
async fn test_detect_false_skips_tool_visibly() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let probe = register(&mut registry, "maybe", Behavior::NotApplicable, PluginCapabilities::default());

    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["maybe"]))
        .await
        .unwrap();
    assert_eq!(probe.runs.load(Ordering::SeqCst), 0);
    assert!(matches!(report.results[0].status, ToolStatus::Skipped { .. }));
    assert!(report.status_body.contains("### maybe\n\n_Skipped:"));
    assert!(report.passed());
}

#[tokio::test]
async fn test_local_server_shared_by_tools() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let first = register(&mut registry, "first", Behavior::Clean, url_caps());
    let second = register(&mut registry, "second", Behavior::Clean, url_caps());

    let target = TargetInputs {
        start_command: Some("echo 'compiling'; echo 'ready - started server'; sleep 30".to_string()),
        ready_timeout_ms: Some(10_000),
        server_url: Some("http://127.0.0.1:4173".to_string()),
        ..TargetInputs::default()
    };
    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["first", "second"]).with_target(target))
        .await
        .unwrap();

    assert!(report.results.iter().all(|r| r.status == ToolStatus::Completed));
    for probe in [&first, &second] {
        assert_eq!(
            probe.seen_base_urls.lock().unwrap()[0].as_deref(),
            Some("http://127.0.0.1:4173")
        );
    }
    assert_eq!(report.manifest.base_url, "http://127.0.0.1:4173");
}

#[tokio::test]
async fn test_server_timeout_fails_dependent_tools_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let needs = register(&mut registry, "needs-url", Behavior::Clean, url_caps());
    let offline = register(&mut registry, "offline", Behavior::Clean, PluginCapabilities::default());

    let target = TargetInputs {
        start_command: Some("sleep 5".to_string()),
        ready_timeout_ms: Some(200),
        ..TargetInputs::default()
    };
    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["needs-url", "offline"]).with_target(target))
        .await
        .unwrap();

    assert_eq!(needs.runs.load(Ordering::SeqCst), 0);
    assert_eq!(offline.runs.load(Ordering::SeqCst), 1);
    match &report.results[0].status {
        ToolStatus::Failed { reason } => assert!(reason.contains("200ms")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.outcome(), RunOutcome::Passed);
}

#[tokio::test]
async fn test_parallel_mode_overlaps_safe_tools() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let probe = Arc::new(Probe::default());
    register_with_probe(&mut registry, "a", Behavior::Sleep(300), parallel_caps(), probe.clone());
    register_with_probe(&mut registry, "b", Behavior::Sleep(300), parallel_caps(), probe.clone());

    let report = Orchestrator::new(registry)
        .run(
            request(dir.path())
                .with_tools(["a", "b"])
                .with_scheduling(SchedulingMode::Parallel),
        )
        .await
        .unwrap();

    assert_eq!(probe.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(probe.runs.load(Ordering::SeqCst), 2);
    assert_eq!(report.tools, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(report.results[0].tool, "a");
    assert_eq!(report.results[1].tool, "b");
}

#[tokio::test]
async fn test_sink_comment_is_upserted() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let provenance = Provenance {
        owner: Some("acme".to_string()),
        repo: Some("site".to_string()),
        pr: Some(12),
        sha: Some("deadbeef".to_string()),
    };

    for (i, behavior) in [Behavior::HighFinding, Behavior::Clean].into_iter().enumerate() {
        let mut registry = ToolRegistry::new();
        register(&mut registry, "perf", behavior, PluginCapabilities::default());
        let req = RunRequest::new(config(), dir.path().join(format!("run-{}", i)))
            .with_tools(["perf"])
            .with_provenance(provenance.clone());
        Orchestrator::new(registry)
            .with_sink(sink.clone())
            .run(req)
            .await
            .unwrap();
    }

    let comments = sink.comments();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].body.contains("**Status:** Passing"));

    let checks = sink.checks();
    assert_eq!(checks.len(), 2);
    assert!(!checks[0].success);
    assert!(checks[1].success);
    assert_eq!(checks[1].sha, "deadbeef");
}

#[tokio::test]
async fn test_bundle_contains_run_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "perf", Behavior::Clean, PluginCapabilities::default());

    let bundle = dir.path().join("out").join("wapmetrics.tar.gz");
    let report = Orchestrator::new(registry)
        .run(request(dir.path()).with_tools(["perf"]).with_bundle_path(&bundle))
        .await
        .unwrap();

    assert_eq!(report.bundle_path.as_deref(), Some(bundle.as_path()));
    let entries = list_bundle(&bundle).unwrap();
    for expected in [MANIFEST_FILE, FINDINGS_FILE, SUMMARY_FILE, "perf/raw.txt"] {
        assert!(entries.iter().any(|e| e == expected), "missing {}", expected);
    }
}

#[tokio::test]
async fn test_reused_work_dir_rejected_before_tools_run() {
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("run");
    let mut registry = ToolRegistry::new();
    let perf = register(&mut registry, "perf", Behavior::Clean, PluginCapabilities::default());
    let orchestrator = Orchestrator::new(registry);

    orchestrator
        .run(RunRequest::new(config(), &work).with_tools(["perf"]))
        .await
        .unwrap();
    let err = orchestrator
        .run(RunRequest::new(config(), &work).with_tools(["perf"]))
        .await
        .unwrap_err();

    assert!(matches!(err, WapmError::ManifestExists(_)));
    assert_eq!(perf.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_scratch_files_are_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "perf", Behavior::Clean, PluginCapabilities::default());

    let req = request(dir.path()).with_tools(["perf"]);
    let stale = req.work_dir.join("perf").join("lhr-stale.json");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "{}").unwrap();

    let report = Orchestrator::new(registry).run(req).await.unwrap();
    assert!(!stale.exists());
    assert!(report.work_dir.join("perf").join("raw.txt").is_file());
}

#[tokio::test]
async fn test_bundle_inside_work_dir_rejected_before_publish() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut registry = ToolRegistry::new();
    let perf = register(&mut registry, "perf", Behavior::Clean, PluginCapabilities::default());

    let req = request(dir.path())
        .with_tools(["perf"])
        .with_provenance(Provenance {
            owner: Some("acme".to_string()),
            repo: Some("site".to_string()),
            pr: Some(7),
            sha: Some("cafe".to_string()),
        });
    let work = req.work_dir.clone();
    let req = req.with_bundle_path(work.join("out").join("b.tgz"));

    let err = Orchestrator::new(registry)
        .with_sink(sink.clone())
        .run(req)
        .await
        .unwrap_err();

    assert!(matches!(err, WapmError::ConfigInvalid(ref msg) if msg.contains("outside the work directory")));
    assert_eq!(perf.runs.load(Ordering::SeqCst), 0);
    assert!(sink.comments().is_empty());
    assert!(sink.checks().is_empty());
    assert!(!work.exists());
}

#[tokio::test]
async fn test_selected_name_keys_config_and_scratch_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    let probe = register_alias(&mut registry, "lighthouse", "lhci");

    let config = parse_config(
        r#"{
            "settings": { "baseUrl": "https://x.test" },
            "routes": ["/"],
            "plugins": [{ "name": "lighthouse", "config": { "level": "persisted" } }]
        }"#,
    )
    .unwrap();
    let report = Orchestrator::new(registry)
        .run(RunRequest::new(config, dir.path().join("run")))
        .await
        .unwrap();

    assert_eq!(report.results[0].tool, "lighthouse");
    assert_eq!(probe.seen_configs.lock().unwrap()[0]["level"], json!("persisted"));
    assert!(report.work_dir.join("lighthouse").join("raw.txt").is_file());
    assert!(!report.work_dir.join("lhci").exists());
}

#[tokio::test]
async fn test_deadline_cancels_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    register(&mut registry, "slow", Behavior::Sleep(5_000), PluginCapabilities::default());

    let err = Orchestrator::new(registry)
        .run_with_deadline(
            request(dir.path()).with_tools(["slow"]),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WapmError::RunCancelled(_)));
}

/// Live, non-zombie process.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_deadline_terminates_local_server() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("server.pid");
    let mut registry = ToolRegistry::new();
    let slow = register(&mut registry, "slow", Behavior::Sleep(10_000), url_caps());

    let target = TargetInputs {
        start_command: Some(format!(
            "echo $$ > '{}'; echo 'ready'; exec sleep 30",
            pid_file.display()
        )),
        ready_timeout_ms: Some(10_000),
        server_url: Some("http://127.0.0.1:4173".to_string()),
        ..TargetInputs::default()
    };
    let err = Orchestrator::new(registry)
        .run_with_deadline(
            request(dir.path()).with_tools(["slow"]).with_target(target),
            Duration::from_millis(1_500),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, WapmError::RunCancelled(_)));
    assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
    let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();

    let mut alive = true;
    for _ in 0..50 {
        alive = process_alive(pid);
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!alive, "server {} still running after cancellation", pid);
}

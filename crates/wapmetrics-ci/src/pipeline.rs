//! Run orchestration.
//!
//! One run moves through `init -> target_provisioned -> tools ->
//! aggregated -> reported -> packaged`. Tool names are validated before
//! anything touches the filesystem. After that a tool's error is recorded
//! against that tool and the run continues (unless the failure policy is
//! [`FailurePolicy::Abort`]). The target is torn down on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::{Map, Value};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;
use wapmetrics_core::obs::{
    emit_gate_evaluated, emit_phase, emit_run_finished, emit_run_started, emit_tool_failed,
    emit_tool_finished, emit_tool_started, run_span,
};
use wapmetrics_core::reporting::{fallback_section, with_marker};
use wapmetrics_core::{
    aggregate, render_status, resolve_with_overrides, BudgetResolution, GateVerdict, Manifest,
    ManifestBuilder, NormalizedConfig, Provenance, Result, ToolResult, ToolStatus, WapmError,
    REPORT_TITLE, STICKY_MARKER,
};

use crate::bundle::{
    check_bundle_path, package_dir, write_json, FINDINGS_FILE, MANIFEST_FILE, SUMMARY_FILE,
};
use crate::layers::merge_layers;
use crate::plugin::{MeasurementTool, PluginCapabilities, PluginDescriptor, RunContext};
use crate::registry::ToolRegistry;
use crate::sink::{CheckRun, PullRequestRef, ReportSink};
use crate::target::{TargetInputs, TargetProvisioner, TargetStrategy};

/// What to do when a tool fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the failure and run the remaining tools.
    #[default]
    Continue,
    /// Stop at the first failure.
    Abort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchedulingMode {
    #[default]
    Sequential,
    /// Overlap consecutive parallel-safe tools that do not need the local
    /// server.
    Parallel,
}

/// Run state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    TargetProvisioned,
    Aggregated,
    Reported,
    Packaged,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::TargetProvisioned => "target_provisioned",
            RunPhase::Aggregated => "aggregated",
            RunPhase::Reported => "reported",
            RunPhase::Packaged => "packaged",
        }
    }
}

/// Everything a run needs, assembled once by the caller.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: NormalizedConfig,
    /// Replaces the enabled plugins from the config when non-empty.
    pub tools: Vec<String>,
    /// Run-level per-tool config, highest precedence.
    pub tool_overrides: BTreeMap<String, Map<String, Value>>,
    /// Per-metric overrides layered over the global budget.
    pub budget_overrides: BTreeMap<String, f64>,
    pub routes_override: Vec<String>,
    pub target: TargetInputs,
    pub provenance: Provenance,
    pub work_dir: PathBuf,
    /// Directory tool processes run in.
    pub cwd: PathBuf,
    pub bundle_path: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
    pub scheduling: SchedulingMode,
}

impl RunRequest {
    pub fn new(config: NormalizedConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            tools: Vec::new(),
            tool_overrides: BTreeMap::new(),
            budget_overrides: BTreeMap::new(),
            routes_override: Vec::new(),
            target: TargetInputs::default(),
            provenance: Provenance::default(),
            work_dir: work_dir.into(),
            cwd: PathBuf::from("."),
            bundle_path: None,
            failure_policy: FailurePolicy::default(),
            scheduling: SchedulingMode::default(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tool_override(mut self, tool: impl Into<String>, config: Map<String, Value>) -> Self {
        self.tool_overrides.insert(tool.into(), config);
        self
    }

    pub fn with_target(mut self, target: TargetInputs) -> Self {
        self.target = target;
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_scheduling(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = mode;
        self
    }

    pub fn with_bundle_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundle_path = Some(path.into());
        self
    }

    /// Pull request to report to, when provenance names one.
    pub fn pull_request(&self) -> Option<PullRequestRef> {
        let p = &self.provenance;
        Some(PullRequestRef {
            owner: p.owner.clone()?,
            repo: p.repo.clone()?,
            number: p.pr?,
        })
    }
}

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    GateFailed,
    RunError,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Passed => 0,
            RunOutcome::GateFailed => 1,
            RunOutcome::RunError => 2,
        }
    }
}

/// Result of a complete run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub tools: Vec<String>,
    /// Per-tool results in configured order.
    pub results: Vec<ToolResult>,
    pub verdict: GateVerdict,
    pub warnings: Vec<String>,
    pub manifest: Manifest,
    /// Status body including the sticky marker.
    pub status_body: String,
    pub work_dir: PathBuf,
    pub bundle_path: Option<PathBuf>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.pass
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.verdict.run_failed() {
            RunOutcome::RunError
        } else if self.verdict.pass {
            RunOutcome::Passed
        } else {
            RunOutcome::GateFailed
        }
    }
}

/// Group tool indices into batches executed one after another.
///
/// A batch has more than one member only in parallel mode, and only for
/// consecutive parallel-safe tools that do not need the local server.
pub fn plan_batches(capabilities: &[PluginCapabilities], mode: SchedulingMode) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut open = false;
    for (index, caps) in capabilities.iter().enumerate() {
        let overlaps =
            mode == SchedulingMode::Parallel && caps.parallel_safe && !caps.needs_local_server;
        match batches.last_mut() {
            Some(batch) if overlaps && open => batch.push(index),
            _ => batches.push(vec![index]),
        }
        open = overlaps;
    }
    batches
}

struct PlannedTool {
    /// Name the tool was selected under; keys scratch dir and config.
    name: String,
    tool: Arc<dyn MeasurementTool>,
    descriptor: PluginDescriptor,
}

/// Shared per-run state handed to each tool invocation.
struct RunScope<'a> {
    run_id: &'a str,
    request: &'a RunRequest,
    project: Arc<NormalizedConfig>,
    budgets: Arc<BudgetResolution>,
    provisioner: &'a TargetProvisioner,
}

/// Drives a run over the registered tools.
pub struct Orchestrator {
    registry: ToolRegistry,
    sink: Option<Arc<dyn ReportSink>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            sink: None,
        }
    }

    /// Publish the status comment and check-run through `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Execute a run. Errors are run-level; tool failures are in the
    /// report.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = run_span(&run_id);
        self.run_inner(run_id, request).instrument(span).await
    }

    /// Like [`run`](Self::run), cancelled with `RunCancelled` once
    /// `deadline` elapses. Child processes are killed on drop.
    pub async fn run_with_deadline(&self, request: RunRequest, deadline: Duration) -> Result<RunReport> {
        tokio::time::timeout(deadline, self.run(request))
            .await
            .map_err(|_| WapmError::RunCancelled(format!("deadline of {}ms elapsed", deadline.as_millis())))?
    }

    fn select_tools(&self, request: &RunRequest) -> Result<Vec<(String, Arc<dyn MeasurementTool>)>> {
        let names = if request.tools.is_empty() {
            request.config.enabled_tools()
        } else {
            request.tools.clone()
        };

        let mut seen = BTreeSet::new();
        let mut selected = Vec::new();
        for name in names {
            if !seen.insert(name.clone()) {
                warn!(tool = %name, "Tool selected twice; running it once");
                continue;
            }
            let tool = self.registry.resolve(&name)?;
            selected.push((name, tool));
        }
        Ok(selected)
    }

    async fn run_inner(&self, run_id: String, request: RunRequest) -> Result<RunReport> {
        let start = Instant::now();
        emit_phase(&run_id, RunPhase::Init.as_str());

        // Everything that can reject the run happens before side effects.
        let config = if request.routes_override.is_empty() {
            request.config.clone()
        } else {
            request.config.with_routes_override(&request.routes_override)?
        };
        config.validate()?;
        let selected = self.select_tools(&request)?;
        let strategy = TargetStrategy::select(&request.target, &config.runtime)?;
        let manifest_path = request.work_dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            return Err(WapmError::ManifestExists(manifest_path));
        }
        if let Some(out) = &request.bundle_path {
            check_bundle_path(&request.work_dir, out)?;
        }

        let resolution = resolve_with_overrides(&config, &request.budget_overrides);
        let warnings: Vec<String> = resolution.warnings.iter().map(|w| w.to_string()).collect();
        let tool_names: Vec<String> = selected.iter().map(|(name, _)| name.clone()).collect();
        emit_run_started(&run_id, &tool_names);

        std::fs::create_dir_all(&request.work_dir)?;

        info!(strategy = strategy.name(), "Target strategy selected");
        let provisioner = TargetProvisioner::new(strategy, config.settings.base_url.clone());
        emit_phase(&run_id, RunPhase::TargetProvisioned.as_str());

        let scope = RunScope {
            run_id: &run_id,
            request: &request,
            project: Arc::new(config),
            budgets: Arc::new(resolution),
            provisioner: &provisioner,
        };

        let executed = self.execute_tools(&scope, selected).await;
        provisioner.shutdown().await;
        let results = executed?;

        let verdict = aggregate(&results);
        emit_phase(&run_id, RunPhase::Aggregated.as_str());
        emit_gate_evaluated(&run_id, verdict.findings.len(), verdict.blocking, verdict.pass);

        let body = render_status(&verdict, &results, &warnings);
        let status_body = with_marker(STICKY_MARKER, &body);

        let manifest = ManifestBuilder::new(&scope.project, &scope.budgets)
            .provenance(request.provenance.clone())
            .base_url(provisioner.describe().base_url)
            .tools(tool_names.clone())
            .build();
        manifest.write_once(&manifest_path)?;
        write_json(&request.work_dir.join(FINDINGS_FILE), &verdict.findings)?;
        std::fs::write(request.work_dir.join(SUMMARY_FILE), &status_body)?;

        let mut warnings = warnings;
        if let Err(e) = self.publish(&request, &status_body, &verdict).await {
            warn!(error = %e, "Publishing the status failed");
            warnings.push(e.to_string());
        }
        emit_phase(&run_id, RunPhase::Reported.as_str());

        let bundle_path = match &request.bundle_path {
            Some(out) => Some(package_dir(&request.work_dir, out)?),
            None => None,
        };
        emit_phase(&run_id, RunPhase::Packaged.as_str());

        let duration_ms = start.elapsed().as_millis() as u64;
        emit_run_finished(&run_id, duration_ms, verdict.pass);

        Ok(RunReport {
            run_id,
            tools: tool_names,
            results,
            verdict,
            warnings,
            manifest,
            status_body,
            work_dir: request.work_dir.clone(),
            bundle_path,
            duration_ms,
        })
    }

    async fn execute_tools(
        &self,
        scope: &RunScope<'_>,
        selected: Vec<(String, Arc<dyn MeasurementTool>)>,
    ) -> Result<Vec<ToolResult>> {
        let mut slots: Vec<Option<ToolResult>> = vec![None; selected.len()];
        let mut planned: Vec<Option<PlannedTool>> = Vec::with_capacity(selected.len());

        for (index, (name, tool)) in selected.into_iter().enumerate() {
            match tool.init() {
                Ok(descriptor) => {
                    if descriptor.name != name {
                        debug!(tool = %name, descriptor = %descriptor.name, "Tool registered under another name");
                    }
                    planned.push(Some(PlannedTool { name, tool, descriptor }))
                }
                Err(e) => {
                    emit_tool_failed(&name, &e);
                    self.check_policy(scope, &name, &e.to_string())?;
                    slots[index] = Some(failed_result(&name, format!("init failed: {}", e), 0));
                    planned.push(None);
                }
            }
        }

        let capabilities: Vec<PluginCapabilities> = planned
            .iter()
            .map(|p| p.as_ref().map(|p| p.descriptor.capabilities).unwrap_or_default())
            .collect();

        for batch in plan_batches(&capabilities, scope.request.scheduling) {
            let runnable: Vec<(usize, &PlannedTool)> = batch
                .into_iter()
                .filter_map(|i| planned[i].as_ref().map(|p| (i, p)))
                .collect();
            if runnable.len() > 1 {
                debug!(tools = runnable.len(), "Running tools concurrently");
            }

            let outcomes = join_all(runnable.iter().map(|(_, p)| self.execute_tool(scope, p))).await;

            for ((index, _), result) in runnable.iter().zip(outcomes) {
                if let ToolStatus::Failed { reason } = &result.status {
                    self.check_policy(scope, &result.tool, reason)?;
                }
                slots[*index] = Some(result);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    fn check_policy(&self, scope: &RunScope<'_>, tool: &str, reason: &str) -> Result<()> {
        if scope.request.failure_policy == FailurePolicy::Abort {
            warn!(tool = %tool, "Aborting run after tool failure");
            return Err(WapmError::ToolExecutionFailed {
                tool: tool.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Run one tool through detect/prepare/run/summarize. Never fails; an
    /// error becomes a failed result attributed to the tool.
    async fn execute_tool(&self, scope: &RunScope<'_>, planned: &PlannedTool) -> ToolResult {
        let start = Instant::now();
        let descriptor = &planned.descriptor;
        let name = planned.name.as_str();
        emit_tool_started(name, &descriptor.version);

        let needs_target = descriptor.capabilities.needs_target();
        let target = if needs_target {
            match scope.provisioner.acquire().await {
                Ok(target) => target,
                Err(e) => {
                    emit_tool_failed(name, &e);
                    return failed_result(name, e.to_string(), elapsed_ms(start));
                }
            }
        } else {
            scope.provisioner.describe()
        };

        let scratch_dir = scope.request.work_dir.join(name);
        let ctx = RunContext {
            run_id: scope.run_id.to_string(),
            tool: name.to_string(),
            target,
            scratch_dir: scratch_dir.clone(),
            cwd: scope.request.cwd.clone(),
            config: merge_layers(
                &descriptor.defaults,
                scope.project.tool_config(name),
                scope.request.tool_overrides.get(name),
            ),
            project: scope.project.clone(),
            budgets: scope.budgets.clone(),
            provenance: scope.request.provenance.clone(),
        };

        let outcome = drive_tool(planned.tool.as_ref(), &ctx, &scratch_dir).await;
        if needs_target {
            scope.provisioner.release().await;
        }

        let duration_ms = elapsed_ms(start);
        match outcome {
            Ok(Driven::Skipped) => {
                info!(tool = %name, "Tool skipped by detect");
                ToolResult {
                    tool: name.to_string(),
                    status: ToolStatus::Skipped {
                        reason: "not applicable to this project".to_string(),
                    },
                    findings: Vec::new(),
                    artifacts: Vec::new(),
                    summary: String::new(),
                    duration_ms,
                }
            }
            Ok(Driven::Completed { output, summary }) => {
                emit_tool_finished(name, output.findings.len(), duration_ms);
                ToolResult {
                    tool: name.to_string(),
                    status: ToolStatus::Completed,
                    summary: summary.unwrap_or_else(|| fallback_section(name, &output.findings)),
                    findings: output.findings,
                    artifacts: output.artifacts,
                    duration_ms,
                }
            }
            Err(e) => {
                emit_tool_failed(name, &e);
                failed_result(name, format!("{:#}", e), duration_ms)
            }
        }
    }

    async fn publish(&self, request: &RunRequest, body: &str, verdict: &GateVerdict) -> Result<()> {
        let (Some(sink), Some(pr)) = (&self.sink, request.pull_request()) else {
            debug!("No sink or pull request; skipping publish");
            return Ok(());
        };
        sink.upsert_comment(&pr, STICKY_MARKER, body).await?;
        if let Some(sha) = &request.provenance.sha {
            let check = CheckRun {
                sha: sha.clone(),
                title: REPORT_TITLE.to_string(),
                summary: format!("{}\n\n{}", verdict.message(), body),
                success: verdict.pass,
            };
            sink.set_check(&pr, &check).await?;
        }
        Ok(())
    }
}

enum Driven {
    Skipped,
    Completed {
        output: crate::plugin::ToolOutput,
        summary: Option<String>,
    },
}

async fn drive_tool(tool: &dyn MeasurementTool, ctx: &RunContext, scratch_dir: &Path) -> anyhow::Result<Driven> {
    // Leftovers from an interrupted run would be read back as results.
    if scratch_dir.exists() {
        std::fs::remove_dir_all(scratch_dir)?;
    }
    std::fs::create_dir_all(scratch_dir)?;
    if !tool.detect(ctx).await? {
        return Ok(Driven::Skipped);
    }
    tool.prepare(ctx).await?;
    let output = tool.run(ctx).await?;
    let summary = tool.summarize(ctx, &output).await;
    Ok(Driven::Completed { output, summary })
}

fn failed_result(tool: &str, reason: String, duration_ms: u64) -> ToolResult {
    ToolResult {
        tool: tool.to_string(),
        status: ToolStatus::Failed { reason },
        findings: Vec::new(),
        artifacts: Vec::new(),
        summary: String::new(),
        duration_ms,
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

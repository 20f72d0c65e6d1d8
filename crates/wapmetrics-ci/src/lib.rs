//! WAPMetrics CI
//!
//! Runs measurement tools against a provisioned target, aggregates their
//! findings into a gate verdict and packages the run:
//! - [`plugin`]: the tool contract and per-invocation context
//! - [`registry`]: name -> tool factories
//! - [`target`]: preview / static / local server provisioning
//! - [`pipeline`]: the orchestrator state machine
//! - [`adapters`]: Lighthouse CI and axe
//! - [`sink`] and [`bundle`]: reporting and packaging

pub mod adapters;
pub mod bundle;
pub mod layers;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod target;

pub use adapters::{AxeTool, LighthouseTool, AXE_TOOL, LHCI_TOOL};
pub use bundle::{check_bundle_path, list_bundle, package_dir};
pub use pipeline::{
    plan_batches, FailurePolicy, Orchestrator, RunOutcome, RunPhase, RunReport, RunRequest,
    SchedulingMode,
};
pub use plugin::{MeasurementTool, PluginCapabilities, PluginDescriptor, RunContext, ToolOutput};
pub use registry::ToolRegistry;
pub use runner::{CommandOutcome, CommandRunner, CommandSpec};
pub use sink::{CheckRun, GithubSink, MemorySink, PullRequestRef, ReportSink};
pub use target::{StartCommand, TargetInfo, TargetInputs, TargetProvisioner, TargetStrategy};

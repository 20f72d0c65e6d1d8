//! WAPMetrics CLI
//!
//! The `wapmetrics` command runs web-quality measurements for CI.
//!
//! ## Commands
//!
//! - `run`: measure the configured routes, gate on findings, report and bundle
//! - `validate`: check a config file and show resolved budgets
//! - `transform`: print the generated Lighthouse CI configuration
//!
//! Exit codes: `0` pass, `1` gate failed, `2` run error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, Level};

use wapmetrics_ci::sink::GITHUB_API_URL;
use wapmetrics_ci::{
    FailurePolicy, GithubSink, Orchestrator, RunOutcome, RunRequest, SchedulingMode,
    TargetInputs, ToolRegistry,
};
use wapmetrics_core::{load_config, resolve, transform, Provenance, TransformOptions, WapmError};

#[derive(Parser)]
#[command(name = "wapmetrics")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Web performance and accessibility gate for CI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the config file
    #[arg(
        short,
        long,
        global = true,
        env = "WAPMETRICS_CONFIG",
        default_value = "wapmetrics.config.json"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the selected tools and gate on their findings
    Run(RunArgs),

    /// Validate the config and show resolved thresholds per route
    Validate,

    /// Print the generated Lighthouse CI config without running anything
    Transform {
        /// Directory LHCI reports are written to
        #[arg(long, default_value = ".wapmetrics/lhci")]
        output_dir: PathBuf,

        /// Base URL replacing settings.baseUrl
        #[arg(long)]
        base_url: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Tools to run, replacing the enabled plugins (comma-separated)
    #[arg(long, env = "WAPMETRICS_TOOLS", value_delimiter = ',')]
    tools: Vec<String>,

    /// Routes to measure, replacing the configured routes (comma-separated)
    #[arg(long, env = "WAPMETRICS_ROUTES", value_delimiter = ',')]
    routes: Vec<String>,

    /// Budget override layered over the global budget: metric=value
    #[arg(long = "budget", value_parser = parse_budget_override)]
    budgets: Vec<(String, f64)>,

    /// Per-tool config override: tool.key=value (value parsed as JSON when possible)
    #[arg(long = "tool-config", value_parser = parse_tool_override)]
    tool_config: Vec<(String, String, Value)>,

    /// Deployed preview to measure
    #[arg(long, env = "WAPMETRICS_PREVIEW_URL")]
    preview_url: Option<String>,

    /// Static build output to serve
    #[arg(long, env = "WAPMETRICS_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Command that starts a local server
    #[arg(long, env = "WAPMETRICS_START_COMMAND")]
    start_command: Option<String>,

    /// Regex a server output line must match to count as ready
    #[arg(long)]
    ready_pattern: Option<String>,

    #[arg(long)]
    ready_timeout_ms: Option<u64>,

    /// URL the started server listens on
    #[arg(long)]
    server_url: Option<String>,

    /// Run work directory
    #[arg(long, default_value = ".wapmetrics")]
    work_dir: PathBuf,

    /// Write a .tar.gz bundle of the work directory here
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Stop at the first tool failure
    #[arg(long)]
    fail_fast: bool,

    /// Overlap parallel-safe tools
    #[arg(long)]
    parallel: bool,

    /// Cancel the run after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, env = "GITHUB_REPOSITORY_OWNER")]
    owner: Option<String>,

    #[arg(long, env = "WAPMETRICS_REPO")]
    repo: Option<String>,

    #[arg(long, env = "WAPMETRICS_PR")]
    pr: Option<u64>,

    #[arg(long, env = "GITHUB_SHA")]
    sha: Option<String>,

    /// Token used to publish the status comment and check-run
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    #[arg(long, env = "GITHUB_API_URL", default_value = GITHUB_API_URL)]
    github_api_url: String,
}

fn parse_budget_override(raw: &str) -> std::result::Result<(String, f64), String> {
    let (metric, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected metric=value, got '{}'", raw))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("budget for '{}' is not a number: '{}'", metric, value))?;
    if !value.is_finite() {
        return Err(format!("budget for '{}' must be finite", metric));
    }
    Ok((metric.trim().to_string(), value))
}

fn parse_tool_override(raw: &str) -> std::result::Result<(String, String, Value), String> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected tool.key=value, got '{}'", raw))?;
    let (tool, key) = path
        .split_once('.')
        .ok_or_else(|| format!("expected tool.key, got '{}'", path))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((tool.to_string(), key.to_string(), value))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    wapmetrics_core::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run(args) => cmd_run(&cli.config, args).await,
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Transform {
            output_dir,
            base_url,
        } => cmd_transform(&cli.config, &output_dir, base_url),
    };

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(RunOutcome::RunError.exit_code())
        }
    }
}

fn build_request(config_path: &Path, args: &RunArgs) -> Result<RunRequest> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    let mut tool_overrides: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for (tool, key, value) in &args.tool_config {
        tool_overrides
            .entry(tool.clone())
            .or_default()
            .insert(key.clone(), value.clone());
    }

    let mut request = RunRequest::new(config, &args.work_dir)
        .with_tools(args.tools.iter().filter(|t| !t.trim().is_empty()).cloned())
        .with_target(TargetInputs {
            preview_url: args.preview_url.clone(),
            static_dist_dir: args.static_dir.clone(),
            start_command: args.start_command.clone(),
            ready_pattern: args.ready_pattern.clone(),
            ready_timeout_ms: args.ready_timeout_ms,
            server_url: args.server_url.clone(),
        })
        .with_provenance(Provenance {
            owner: args.owner.clone(),
            repo: args.repo.clone(),
            pr: args.pr,
            sha: args.sha.clone(),
        })
        .with_failure_policy(if args.fail_fast {
            FailurePolicy::Abort
        } else {
            FailurePolicy::Continue
        })
        .with_scheduling(if args.parallel {
            SchedulingMode::Parallel
        } else {
            SchedulingMode::Sequential
        });

    request.routes_override = args.routes.clone();
    request.budget_overrides = args.budgets.iter().cloned().collect();
    request.tool_overrides = tool_overrides;
    request.cwd = std::env::current_dir().context("Failed to read current directory")?;
    if let Some(bundle) = &args.bundle {
        request = request.with_bundle_path(bundle);
    }
    Ok(request)
}

async fn cmd_run(config_path: &Path, args: RunArgs) -> Result<RunOutcome> {
    let request = build_request(config_path, &args)?;

    let mut orchestrator = Orchestrator::new(ToolRegistry::with_builtins());
    if let Some(token) = &args.github_token {
        let sink = GithubSink::with_api_url(&args.github_api_url, token)?;
        orchestrator = orchestrator.with_sink(Arc::new(sink));
    }

    let report = match args.timeout_secs {
        Some(secs) => {
            orchestrator
                .run_with_deadline(request, Duration::from_secs(secs))
                .await
        }
        None => orchestrator.run(request).await,
    }
    .context("Run failed")?;

    println!("{}", report.status_body);
    info!(
        run_id = %report.run_id,
        findings = report.verdict.findings.len(),
        blocking = report.verdict.blocking,
        "{}",
        report.verdict.message()
    );
    if let Some(bundle) = &report.bundle_path {
        info!(bundle = %bundle.display(), "Bundle written");
    }

    Ok(report.outcome())
}

fn cmd_validate(config_path: &Path) -> Result<RunOutcome> {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e @ (WapmError::ConfigInvalid(_) | WapmError::ConfigNotFound { .. })) => {
            println!("✗ {}", e);
            return Ok(RunOutcome::RunError);
        }
        Err(e) => return Err(e).context("Failed to load config"),
    };

    let resolution = resolve(&config);
    println!("✓ {} is valid", config_path.display());
    println!("Base URL: {}", config.settings.base_url);
    println!("Runs per URL: {}", config.settings.number_of_runs());
    println!();

    for route in &config.routes {
        println!("  {}", route.path());
        match resolution.for_route(route.path()) {
            Some(thresholds) if !thresholds.is_empty() => {
                for (metric, ceiling) in thresholds.iter() {
                    println!("    {} <= {}", metric, ceiling);
                }
            }
            _ => println!("    (unconstrained)"),
        }
    }

    if !resolution.warnings.is_empty() {
        println!();
        for warning in &resolution.warnings {
            println!("⚠ {}", warning);
        }
    }

    let tools = config.enabled_tools();
    if !tools.is_empty() {
        println!();
        println!("Enabled tools: {}", tools.join(", "));
    }
    Ok(RunOutcome::Passed)
}

fn cmd_transform(config_path: &Path, output_dir: &Path, base_url: Option<String>) -> Result<RunOutcome> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let mut options = TransformOptions::new(output_dir);
    if let Some(url) = base_url {
        options = options.with_base_url(url);
    }
    if let Some(dir) = &config.runtime.static_dist_dir {
        options = options.with_static_dist_dir(dir.clone());
    }

    let rc = transform(&config, &resolve(&config), &options);
    println!("{}", rc.to_json_pretty()?);
    Ok(RunOutcome::Passed)
}

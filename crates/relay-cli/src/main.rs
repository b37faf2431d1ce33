//! Relay - artifact promotion pipeline
//!
//! Usage:
//!   relay init                          # Write a starter relay.toml
//!   relay export --plan p --source dir  # Publish an export run
//!   relay promote <artifact> --plan p   # Start or continue a chain
//!   relay approve <request> <env>       # Approve a waiting stage
//!   relay status [request]              # Show promotion requests

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::artifact::{Artifact, SourceRef};
use relay_core::config::RelayConfig;
use relay_core::context::{AppContext, detect_run_url};
use relay_core::promotion::{PromotionReport, PromotionRequest, PromotionStatus};
use relay_core::template::{IcfTemplate, TemplateFormat};
use relay_core::tracking::{LedgerEntry, TrackingIssue};
use relay_core::types::ConfigScope;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Promote exported artifacts through deployment environments", long_about = None)]
struct Cli {
    /// Project configuration file (default: ./relay.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Link to the pipeline run driving this invocation
    #[arg(long, global = true)]
    run_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter relay.toml
    Init {
        /// Overwrite an existing configuration
        #[arg(long, short)]
        force: bool,
    },

    /// Publish the output of an export run as an artifact
    Export {
        /// Plan the artifact is exported for
        #[arg(long)]
        plan: String,

        /// Directory holding the export output
        #[arg(long)]
        source: PathBuf,

        /// Package name recorded with the artifact
        #[arg(long)]
        package_name: Option<String>,

        /// Explicit artifact name (derived from content otherwise)
        #[arg(long)]
        name: Option<String>,

        /// Export run id (defaults to the run URL's last segment)
        #[arg(long)]
        run_id: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Start or continue promoting an artifact along a plan
    Promote {
        /// Published artifact name
        artifact: String,

        /// Plan to promote along
        #[arg(long)]
        plan: String,

        /// Import even where this artifact was already imported
        #[arg(long)]
        force: bool,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Approve the stage waiting on an environment
    Approve {
        request: String,
        environment: String,

        /// Who approved
        #[arg(long)]
        reviewer: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Reject the stage waiting on an environment
    Reject {
        request: String,
        environment: String,

        /// Why the promotion was rejected
        #[arg(long)]
        reason: Option<String>,

        /// Who rejected
        #[arg(long)]
        reviewer: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Continue a suspended or interrupted request
    Resume {
        request: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Re-enter approval after a rejection (allow-reentry policy only)
    Retry {
        request: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Give up on a request waiting for overrides or approval
    Abandon {
        request: String,

        /// Why the request is abandoned
        #[arg(long, default_value = "abandoned by operator")]
        reason: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show promotion requests
    Status {
        /// Show one request in detail
        request: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Manage tracking issues
    Issue(IssueArgs),

    /// Inspect integration configuration templates
    Template(TemplateArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
    /// Only show problems (non-zero exit if any)
    Quiet,
}

#[derive(Args)]
struct IssueArgs {
    #[command(subcommand)]
    command: IssueSubcommand,
}

#[derive(Subcommand)]
enum IssueSubcommand {
    /// List tracked issues, one per chain
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Close a tracked issue
    Close {
        issue: String,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

#[derive(Args)]
struct TemplateArgs {
    #[command(subcommand)]
    command: TemplateSubcommand,
}

#[derive(Subcommand)]
enum TemplateSubcommand {
    /// List the keys a template requires
    Keys {
        file: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,relay_core=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let project_root = std::env::current_dir().context("Failed to read current directory")?;
    let mut ctx = AppContext::new(project_root, detect_run_url(cli.run_url.as_deref()));
    if let Some(path) = cli.config {
        ctx = ctx.with_config_path(path);
    }
    tracing::debug!(project = %ctx.project_root().display(), run_url = ctx.run_url(), "relay starting");

    let exit_code = run_cli(&ctx, cli.command)?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn run_cli(ctx: &AppContext, command: Commands) -> Result<i32> {
    match command {
        Commands::Init { force } => run_init(ctx, force),
        Commands::Export {
            plan,
            source,
            package_name,
            name,
            run_id,
            format,
        } => {
            let run_id = run_id.unwrap_or_else(|| run_id_from_url(ctx.run_url()));
            let mut source = SourceRef::new(plan, source, run_id);
            if let Some(package_name) = package_name {
                source = source.with_package_name(package_name);
            }
            if let Some(name) = name {
                source = source.with_artifact_name(name);
            }
            run_export(ctx, &source, format)
        }
        Commands::Promote {
            artifact,
            plan,
            force,
            format,
        } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            print_report(controller.start(&plan, &artifact, force)?, format)
        }
        Commands::Approve {
            request,
            environment,
            reviewer,
            format,
        } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            let reviewer = reviewer.unwrap_or_else(default_reviewer);
            print_report(controller.approve(&request, &environment, &reviewer)?, format)
        }
        Commands::Reject {
            request,
            environment,
            reason,
            reviewer,
            format,
        } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            let reviewer = reviewer.unwrap_or_else(default_reviewer);
            print_report(
                controller.reject(&request, &environment, reason, &reviewer)?,
                format,
            )
        }
        Commands::Resume { request, format } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            print_report(controller.resume(&request)?, format)
        }
        Commands::Retry { request, format } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            print_report(controller.retry(&request)?, format)
        }
        Commands::Abandon {
            request,
            reason,
            format,
        } => {
            let config = ctx.load_config()?;
            let controller = ctx.controller(&config)?;
            print_report(controller.abandon(&request, &reason)?, format)
        }
        Commands::Status { request, format } => run_status(ctx, request, format),
        Commands::Issue(args) => run_issue(ctx, args),
        Commands::Template(args) => run_template(args),
    }
}

fn run_init(ctx: &AppContext, force: bool) -> Result<i32> {
    let store = ctx.config_store(ConfigScope::Project);
    if store.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite",
            store.config_path().display()
        );
    }

    store.save(&RelayConfig::starter())?;
    println!("✓ Wrote {}", store.config_path().display());
    println!("  Set [importer] command before promoting.");
    Ok(0)
}

fn run_export(ctx: &AppContext, source: &SourceRef, format: OutputFormat) -> Result<i32> {
    let config = ctx.load_config()?;
    let artifact = ctx.exporter(&config).export(source)?;

    match format {
        OutputFormat::Table => print_artifact_table(&artifact),
        OutputFormat::Json => print_artifact_json(&artifact)?,
        OutputFormat::Quiet => {}
    }
    Ok(0)
}

fn print_artifact_table(artifact: &Artifact) {
    println!("✓ Exported {}", artifact.artifact_name);
    println!("  Metadata:      {}", artifact.metadata_path.display());
    match &artifact.template_source {
        Some(source) => println!(
            "  Template:      {} ({})",
            source, artifact.template_status
        ),
        None => println!("  Template:      ({})", artifact.template_status),
    }
    println!("  Plan:          {}", artifact.plan);
    if let Some(ref package) = artifact.package_name {
        println!("  Package:       {}", package);
    }
    println!("  Run:           {}", artifact.source_run_id);
    println!("  Content hash:  {}", artifact.content_hash);
    if artifact.required_keys.is_empty() {
        println!("  Required keys: (none)");
    } else {
        println!("  Required keys: {}", join_keys(&artifact.required_keys));
    }
    if !artifact.db_scripts.scripts.is_empty() {
        println!("  DB scripts:    {}", artifact.db_scripts.scripts.len());
    }
    if let Some(ref data_source) = artifact.db_scripts.data_source {
        println!("  Data source:   {}", data_source);
    }
}

fn print_artifact_json(artifact: &Artifact) -> Result<()> {
    let output = serde_json::json!({
        "artifact_name": artifact.artifact_name,
        "metadata_path": artifact.metadata_path,
        "template_path": artifact.template_path,
        "template_status": artifact.template_status,
        "template_source": artifact.template_source,
        "plan": artifact.plan,
        "package_name": artifact.package_name,
        "source_run_id": artifact.source_run_id,
        "content_hash": artifact.content_hash,
        "required_keys": artifact.required_keys,
        "db_scripts": artifact.db_scripts,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Print a controller report and pick the exit code.
///
/// Waiting on approval or overrides is not a failure; a failed stage is.
fn print_report(report: PromotionReport, format: OutputFormat) -> Result<i32> {
    let failed = report.error.is_some() || report.status == PromotionStatus::Failed;

    match format {
        OutputFormat::Table => print_report_table(&report),
        OutputFormat::Json => print_report_json(&report)?,
        OutputFormat::Quiet => {
            if let Some(ref error) = report.error {
                eprintln!("{}: {}", report.request_id, error);
            } else if failed {
                eprintln!("{}: failed", report.request_id);
            }
        }
    }

    Ok(if failed { 1 } else { 0 })
}

fn print_report_table(report: &PromotionReport) {
    let symbol = match report.status {
        PromotionStatus::Succeeded => "✓",
        PromotionStatus::Failed => "✗",
        _ => "•",
    };
    println!("{} {} ({})", symbol, report.request_id, report.chain);
    match report.environment {
        Some(ref env) => println!("  Status: {} at {}", report.status, env),
        None => println!("  Status: {}", report.status),
    }

    for env in &report.imported {
        println!("  ✓ imported into {}", env);
    }
    for env in &report.skipped {
        println!("  • {} already holds this artifact, skipped", env);
    }
    if let Some(ref issue) = report.issue {
        println!("  Issue: {}", issue_link(issue));
    }
    for warning in &report.warnings {
        println!("  ⚠ {}", warning);
    }
    if let Some(ref error) = report.error {
        println!("  ✗ {}", error);
    }

    if report.is_awaiting_approval() {
        if let Some(ref env) = report.environment {
            println!();
            println!(
                "Run 'relay approve {} {}' once the overrides are reviewed.",
                report.request_id, env
            );
        }
    }
}

fn print_report_json(report: &PromotionReport) -> Result<()> {
    let output = serde_json::json!({
        "request_id": report.request_id,
        "chain": report.chain.to_string(),
        "status": report.status,
        "environment": report.environment,
        "imported": report.imported,
        "skipped": report.skipped,
        "issue": report.issue,
        "error": report.error.as_ref().map(|e| e.to_string()),
        "warnings": report.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_status(ctx: &AppContext, request: Option<String>, format: OutputFormat) -> Result<i32> {
    let config = ctx.load_config()?;
    let state_dir = ctx.state_dir(&config);
    let requests = relay_core::promotion::RequestStore::new(state_dir.join("requests"));

    let selected: Vec<PromotionRequest> = match request {
        Some(id) => vec![
            requests
                .load(&id)?
                .ok_or_else(|| anyhow::anyhow!("Unknown request '{}'", id))?,
        ],
        None => requests.list()?,
    };

    match format {
        OutputFormat::Table => {
            if selected.len() == 1 {
                print_request_detail(&selected[0]);
            } else {
                print_requests_table(&selected);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&selected)?),
        OutputFormat::Quiet => {
            let failed: Vec<_> = selected
                .iter()
                .filter(|r| r.status == PromotionStatus::Failed)
                .collect();
            for request in &failed {
                eprintln!("{}: failed", request.id);
            }
            if !failed.is_empty() {
                return Ok(1);
            }
        }
    }
    Ok(0)
}

fn print_requests_table(requests: &[PromotionRequest]) {
    if requests.is_empty() {
        println!("No promotion requests.");
        println!("Run 'relay promote <artifact> --plan <plan>' to start one.");
        return;
    }

    println!(
        "{:<36} {:<20} {:<12} {:<18} Updated",
        "Request", "Plan", "Stage", "Status"
    );
    println!("{}", "-".repeat(100));
    for request in requests {
        let stage = request
            .current_stage()
            .map(|s| s.environment.as_str())
            .unwrap_or("-");
        println!(
            "{:<36} {:<20} {:<12} {:<18} {}",
            truncate(&request.id, 36),
            truncate(request.plan_name(), 20),
            truncate(stage, 12),
            request.status.as_str(),
            request.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_request_detail(request: &PromotionRequest) {
    println!("Request:  {}", request.id);
    println!("Chain:    {}", request.chain);
    println!("Status:   {}", request.status);
    println!("Run:      {}", request.run_url);
    if let Some(ref issue) = request.issue_id {
        println!("Issue:    {}", issue);
    }
    if request.force {
        println!("Forced:   yes");
    }
    println!();
    println!("Stages:");
    for (index, stage) in request.stages.iter().enumerate() {
        let marker = if index == request.current_index && !request.is_terminal() {
            "→"
        } else {
            " "
        };
        let symbol = match stage.status {
            PromotionStatus::Succeeded if stage.skipped => "•",
            PromotionStatus::Succeeded => "✓",
            PromotionStatus::Failed => "✗",
            PromotionStatus::Pending => " ",
            _ => "⚠",
        };
        println!(
            "{} {} {:<12} {}",
            marker,
            symbol,
            stage.environment,
            stage.status.as_str()
        );
        if let Some(ref failure) = stage.failure {
            println!("      {}", failure);
        }
        if let Some(ref approval) = stage.approval {
            println!(
                "      {:?} by {} at {}",
                approval.decision,
                approval.reviewer,
                approval.decided_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        if let Some(ref receipt) = stage.receipt {
            println!("      receipt: {}", receipt);
        }
    }
}

fn run_issue(ctx: &AppContext, args: IssueArgs) -> Result<i32> {
    let config = ctx.load_config()?;
    let tracker = ctx.issue_tracker(&config)?;

    match args.command {
        IssueSubcommand::List { format } => {
            let entries = tracker.entries()?;
            match format {
                OutputFormat::Table => print_issues_table(&entries),
                OutputFormat::Json => print_issues_json(&entries)?,
                OutputFormat::Quiet => {}
            }
        }
        IssueSubcommand::Close { issue, format } => {
            let closed = tracker.close(&issue)?;
            match format {
                OutputFormat::Table => println!("✓ Closed {}", issue_link(&closed)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&closed)?),
                OutputFormat::Quiet => {}
            }
        }
    }
    Ok(0)
}

fn print_issues_table(entries: &[LedgerEntry]) {
    if entries.is_empty() {
        println!("No tracking issues.");
        return;
    }

    println!("{:<40} {:<8} {:<8} Link", "Chain", "Issue", "State");
    println!("{}", "-".repeat(90));
    for entry in entries {
        let state = if entry.issue.is_open() { "open" } else { "closed" };
        println!(
            "{:<40} {:<8} {:<8} {}",
            truncate(&entry.chain.to_string(), 40),
            entry.issue.id,
            state,
            entry.issue.url.as_deref().unwrap_or("-")
        );
        if !entry.superseded.is_empty() {
            let ids: Vec<_> = entry.superseded.iter().map(|i| i.id.as_str()).collect();
            println!("  supersedes {}", ids.join(", "));
        }
    }
}

fn print_issues_json(entries: &[LedgerEntry]) -> Result<()> {
    let output: Vec<_> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "chain": e.chain.to_string(),
                "issue": e.issue,
                "superseded": e.superseded,
                "updated_at": e.updated_at,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_template(args: TemplateArgs) -> Result<i32> {
    match args.command {
        TemplateSubcommand::Keys { file, format } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read template: {}", file.display()))?;
            let template = IcfTemplate::parse(&raw, TemplateFormat::detect(&file, &raw));

            match format {
                OutputFormat::Table => {
                    if template.requires_overrides() {
                        for key in template.required_keys() {
                            println!("{}", key);
                        }
                    } else {
                        println!("No keys; no overrides are needed.");
                    }
                }
                OutputFormat::Json => {
                    let output = serde_json::json!({
                        "file": file,
                        "format": template.format(),
                        "json": template.is_json(),
                        "required_keys": template.required_keys(),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Quiet => {}
            }
        }
    }
    Ok(0)
}

fn issue_link(issue: &TrackingIssue) -> String {
    match issue.url {
        Some(ref url) => format!("#{} {}", issue.id, url),
        None => format!("#{}", issue.id),
    }
}

fn join_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> String {
    keys.into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn default_reviewer() -> String {
    std::env::var("GITHUB_ACTOR")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn run_id_from_url(run_url: &str) -> String {
    run_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(run_url)
        .to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

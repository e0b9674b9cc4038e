use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sqlpack_core::{Config, DeployStrategy, Report, Severity};
use sqlpack_db::{
    GrantSpec, MissingRolePolicy, PostgresTarget, ProvisionOptions, PsqlRunner, RoleSpec, TargetDatabase,
};
use sqlpack_engine::{CompileOptions, FetchPolicy, Project, UpgradeOptions};
use sqlpack_plan::Module;

/// sqlpack - SQL module package manager and deployer
#[derive(Parser)]
#[command(name = "sqlpack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: sqlpack.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Connect to the target database over TLS
    #[arg(long, global = true)]
    tls: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a module's dependency closure
    Resolve {
        /// Module directory
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Use only modules already in the workspace
        #[arg(long, conflicts_with = "prefer_local")]
        offline: bool,

        /// Keep installed versions that satisfy a constraint instead of
        /// asking sources for newer ones
        #[arg(long)]
        prefer_local: bool,
    },

    /// Compile the merged plan of a module and its dependencies
    Plan {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Write the plan to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only compile the module's own changes
        #[arg(long)]
        no_deps: bool,

        /// Drop changes after each module's last tag
        #[arg(long)]
        tags_only: bool,
    },

    /// Deploy pending changes
    Deploy {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Override the configured strategy (fast or stream)
        #[arg(long)]
        strategy: Option<DeployStrategy>,

        /// Treat drifted changes as deployed
        #[arg(long)]
        allow_drift: bool,
    },

    /// Revert deployed changes, newest first
    Revert {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Keep this change (module:change or a unique change name) and everything before it
        #[arg(long)]
        to: Option<String>,
    },

    /// Run verify scripts of deployed changes
    Verify {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Output file for the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare the merged plan with the target's registry
    Status {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Output file for the JSON report
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Add requirements (name or name@constraint) to a module
    Install {
        #[arg(required = true)]
        requests: Vec<String>,

        /// Module directory whose manifest is updated
        #[arg(short, long, default_value = ".")]
        target: PathBuf,
    },

    /// Move requirements to their newest versions
    Upgrade {
        /// Requirements to upgrade (all if not specified)
        names: Vec<String>,

        #[arg(short, long, default_value = ".")]
        target: PathBuf,

        /// Show what would change without rewriting the manifest
        #[arg(long)]
        dry_run: bool,

        /// Allow moving to a newer major version
        #[arg(long)]
        major: bool,
    },

    /// Publish a module directory into a filesystem registry
    Publish {
        #[arg(default_value = ".")]
        module: PathBuf,

        /// Registry root directory
        #[arg(short, long)]
        registry: PathBuf,
    },

    /// Provision roles and memberships
    #[command(subcommand)]
    Bootstrap(BootstrapCommand),
}

#[derive(Subcommand)]
enum BootstrapCommand {
    /// Create a role if it does not exist
    Role {
        name: String,

        /// Create a login role with this password
        #[arg(long)]
        password: Option<String>,

        /// Create a login role (without --password it has no password)
        #[arg(long)]
        login: bool,

        /// Grant membership in these roles
        #[arg(long = "in-role")]
        in_roles: Vec<String>,

        /// error, notice or ignore
        #[arg(long, default_value = "error")]
        on_missing_role: MissingRolePolicy,
    },

    /// Grant membership in a role
    Grant {
        role: String,
        member: String,

        #[arg(long, default_value = "error")]
        on_missing_role: MissingRolePolicy,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let default_filter = if cli.verbose { "sqlpack=debug" } else { "sqlpack=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)?
    } else if Path::new("sqlpack.toml").exists() {
        Config::from_file(Path::new("sqlpack.toml"))?
    } else {
        if cli.verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        Config::default()
    };
    config.apply_env()?;

    let tls = cli.tls;
    let project = Project::new(config);

    match cli.command {
        Commands::Resolve { module, offline, prefer_local } => {
            resolve_command(&project, &module, fetch_policy(offline, prefer_local))
        }
        Commands::Plan { module, output, no_deps, tags_only } => {
            let options = CompileOptions {
                include_dependency_changes: project.compile_options().include_dependency_changes && !no_deps,
                include_tags_only: tags_only,
            };
            plan_command(&project, &module, options, output.as_deref())
        }
        Commands::Deploy { module, strategy, allow_drift } => {
            deploy_command(&project, &module, strategy, allow_drift, tls).await
        }
        Commands::Revert { module, to } => revert_command(&project, &module, to.as_deref(), tls).await,
        Commands::Verify { module, output } => verify_command(&project, &module, output.as_deref(), tls).await,
        Commands::Status { module, output } => status_command(&project, &module, output.as_deref(), tls).await,
        Commands::Install { requests, target } => install_command(&project, &target, &requests),
        Commands::Upgrade { names, target, dry_run, major } => {
            upgrade_command(&project, &target, &names, UpgradeOptions { dry_run, major })
        }
        Commands::Publish { module, registry } => publish_command(&module, &registry),
        Commands::Bootstrap(command) => bootstrap_command(&project, command, tls).await,
    }
}

/// Connect to the configured target, with the configured `psql` for streamed deploys
async fn connect(config: &Config, tls: bool) -> Result<PostgresTarget> {
    let target = if tls {
        PostgresTarget::connect_with_tls(&config.database, &config.registry.schema).await?
    } else {
        PostgresTarget::connect(&config.database, &config.registry.schema).await?
    };
    tracing::debug!(target = %target.describe(), "connected");
    Ok(target.with_psql(PsqlRunner::new(config.deploy.psql.clone(), &config.database)))
}

/// `resolve` asks sources for the newest matching version unless told otherwise
fn fetch_policy(offline: bool, prefer_local: bool) -> FetchPolicy {
    if offline {
        FetchPolicy::Offline
    } else if prefer_local {
        FetchPolicy::PreferLocal
    } else {
        FetchPolicy::Latest
    }
}

fn resolve_command(project: &Project, dir: &Path, policy: FetchPolicy) -> Result<()> {
    let module = Module::load(dir)?;
    let resolution = project
        .resolver()
        .with_policy(policy)
        .with_pins(module.manifest.resolved.clone())
        .resolve_module(&module)?;

    print_header("Resolved Modules");
    for (i, m) in resolution.modules().iter().enumerate() {
        let id = m.manifest.id();
        if m.name() == resolution.root_name() {
            println!("  {}. {}", i + 1, id.green().bold());
        } else {
            println!("  {}. {}", i + 1, id);
        }
    }
    println!();
    print_footer();
    Ok(())
}

fn plan_command(project: &Project, dir: &Path, options: CompileOptions, output: Option<&Path>) -> Result<()> {
    let planned = project.plan(dir, options)?;
    match output {
        Some(path) => {
            planned.plan.write_to(path)?;
            eprintln!(
                "{} {} changes to {}",
                "Wrote".green(),
                planned.plan.len(),
                path.display()
            );
        }
        None => print!("{}", planned.plan.render()),
    }
    Ok(())
}

async fn deploy_command(
    project: &Project,
    dir: &Path,
    strategy: Option<DeployStrategy>,
    allow_drift: bool,
    tls: bool,
) -> Result<()> {
    let planned = project.plan(dir, project.compile_options())?;
    let mut options = project.deploy_options();
    if let Some(strategy) = strategy {
        options.strategy = strategy;
    }
    options.allow_drift |= allow_drift;

    let db = connect(project.config(), tls).await?;
    let result = sqlpack_engine::deploy(&planned.plan, &db, &options).await?;

    print_header("Deploy");
    println!("Target:   {}", db.name());
    println!("Strategy: {}", options.strategy);
    println!();
    for change in &result.deployed {
        println!("  {} {}", "+".green(), change);
    }
    for drift in &result.drifted {
        println!(
            "  {} {}:{} {}",
            "~".yellow(),
            drift.module,
            drift.change,
            "(drift accepted)".yellow()
        );
    }
    println!();
    if result.deployed.is_empty() {
        println!("{}", "✓ Nothing to deploy".green().bold());
    } else {
        println!(
            "{}",
            format!(
                "✓ Deployed {} changes ({} already deployed)",
                result.deployed.len(),
                result.already_deployed
            )
            .green()
            .bold()
        );
    }
    print_footer();
    Ok(())
}

async fn revert_command(project: &Project, dir: &Path, to: Option<&str>, tls: bool) -> Result<()> {
    let planned = project.plan(dir, project.compile_options())?;
    let db = connect(project.config(), tls).await?;
    let result = sqlpack_engine::revert(&planned.plan, &db, to).await?;

    print_header("Revert");
    for change in &result.reverted {
        println!("  {} {}", "-".red(), change);
    }
    println!();
    println!("{}", format!("✓ Reverted {} changes", result.reverted.len()).green().bold());
    print_footer();
    Ok(())
}

async fn verify_command(project: &Project, dir: &Path, output: Option<&Path>, tls: bool) -> Result<()> {
    let planned = project.plan(dir, project.compile_options())?;
    let db = connect(project.config(), tls).await?;
    let result = sqlpack_engine::verify(&planned.plan, &db).await?;

    let report = result.to_report(&planned.plan);
    if let Some(path) = output {
        report.write_json(path)?;
    }

    print_header("Verify");
    println!("Verified:     {}", result.verified.len());
    println!("No script:    {}", result.skipped);
    println!("Not deployed: {}", result.not_deployed);
    println!();
    print_diagnostics(&report);
    print_footer();

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn status_command(project: &Project, dir: &Path, output: Option<&Path>, tls: bool) -> Result<()> {
    let planned = project.plan(dir, project.compile_options())?;
    let db = connect(project.config(), tls).await?;
    let report = sqlpack_engine::status(&planned.plan, &db).await?;

    if let Some(path) = output {
        report.write_json(path)?;
    }

    print_header("Registry Status");
    println!("Target:   {}", db.name());
    println!(
        "Deployed: {} of {} changes",
        report.summary.changes_deployed, report.summary.changes_planned
    );
    println!();
    print_diagnostics(&report);
    print_footer();

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn install_command(project: &Project, target: &Path, requests: &[String]) -> Result<()> {
    let installer = project.installer();
    for request in requests {
        let report = installer.install(target, request)?;
        println!(
            "{} {}@{}",
            "Installed".green().bold(),
            report.module,
            report.version
        );
        for (name, version) in &report.closure {
            if name != &report.module {
                println!("  {} {}@{}", "with".dimmed(), name, version);
            }
        }
    }
    Ok(())
}

fn upgrade_command(project: &Project, target: &Path, names: &[String], options: UpgradeOptions) -> Result<()> {
    let report = project.installer().upgrade(target, names, options)?;

    if report.is_noop() {
        println!("{}", "✓ Everything is up to date".green());
        return Ok(());
    }

    let verb = if report.dry_run { "Would upgrade" } else { "Upgraded" };
    for change in &report.changes {
        let from = change
            .from
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{} {} {} -> {}", verb.green().bold(), change.module, from, change.to);
    }

    if !report.affected.is_empty() {
        println!();
        println!("{}", "Affected modules:".bold());
        for module in &report.affected {
            println!("  - {}", module.yellow());
        }
    }
    Ok(())
}

fn publish_command(dir: &Path, registry: &Path) -> Result<()> {
    let module = Module::load(dir)?;
    let archive = sqlpack_source::publish(dir, registry, module.name(), &module.manifest.version)?;
    println!(
        "{} {} to {}",
        "Published".green().bold(),
        module.manifest.id(),
        archive.display()
    );
    Ok(())
}

async fn bootstrap_command(project: &Project, command: BootstrapCommand, tls: bool) -> Result<()> {
    let db = connect(project.config(), tls).await?;

    match command {
        BootstrapCommand::Role { name, password, login, in_roles, on_missing_role } => {
            let role = if login || password.is_some() {
                RoleSpec::login(&name, password)
            } else {
                RoleSpec::group(&name)
            }
            .with_in_roles(in_roles);

            db.ensure_role(&role, &ProvisionOptions::new(on_missing_role)).await?;
            println!("{} {}", "✓ Role ready:".green(), name);
        }
        BootstrapCommand::Grant { role, member, on_missing_role } => {
            let grant = GrantSpec::new(&role, &member);
            db.ensure_grant(&grant, &ProvisionOptions::new(on_missing_role)).await?;
            println!("{} {} -> {}", "✓ Membership ready:".green(), member, role);
        }
    }
    Ok(())
}

fn print_header(title: &str) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", title.bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
}

fn print_footer() {
    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

/// Print report summary and diagnostics
fn print_diagnostics(report: &Report) {
    println!("{}", "Summary:".bold());
    if report.summary.errors > 0 {
        println!("  Errors:   {}", format!("{}", report.summary.errors).red().bold());
    } else {
        println!("  Errors:   {}", format!("{}", report.summary.errors).green());
    }

    if report.summary.warnings > 0 {
        println!("  Warnings: {}", format!("{}", report.summary.warnings).yellow());
    } else {
        println!("  Warnings: {}", format!("{}", report.summary.warnings).green());
    }

    println!("  Info:     {}", report.summary.info);
    println!();

    if report.diagnostics.is_empty() {
        println!("{}", "✓ No issues found!".green().bold());
        return;
    }

    println!("{}", "Diagnostics:".bold());
    for diag in &report.diagnostics {
        let severity_str = match diag.severity {
            Severity::Error => "ERROR".red().bold(),
            Severity::Warn => "WARN".yellow().bold(),
            Severity::Info => "INFO".cyan(),
        };

        println!("  [{}] {}: {}", severity_str, diag.code, diag.message);

        if let Some(exp) = &diag.expected {
            println!("    Recorded: {}", exp);
        }
        if let Some(act) = &diag.actual {
            println!("    Current:  {}", act);
        }
        if let Some(hint) = &diag.hint {
            println!("    {}", hint.dimmed());
        }
    }
}

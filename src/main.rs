//! taskstack CLI entrypoint.
//!
//! This is the main entrypoint for the taskstack command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use taskstack_deploy::backend::{AwsBackend, CloudBackend, MemoryBackend};
use taskstack_deploy::cli::{
    BackendKind, Cli, Commands, LogFormat, OutputFormat, OutputFormatter, StateCommands,
};
use taskstack_deploy::config::{
    ConfigParser, ConfigValidator, SecretSource, StackConfig, find_config_file,
};
use taskstack_deploy::error::{Result, StackError};
use taskstack_deploy::health::HealthChecker;
use taskstack_deploy::planner::{CancelSignal, cancel_pair};
use taskstack_deploy::provisioner::Provisioner;
use taskstack_deploy::state::{MemoryStateStore, STATE_DIR, StateStore, open_store};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_retryable() {
                let delay = e.retry_delay_secs().unwrap_or(5);
                eprintln!("This error is usually temporary; retry in about {delay}s.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_env("TASKSTACK_LOG").unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Everything a stack command needs.
struct Context {
    config: StackConfig,
    backend: Arc<dyn CloudBackend>,
    store: Box<dyn StateStore>,
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { ref path, force } => cmd_init(path, force),
        Commands::Validate { warnings } => cmd_validate(&cli, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(&cli, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(&cli, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(&cli, yes, &formatter).await,
        Commands::Outputs { ref name } => cmd_outputs(&cli, name.as_deref(), &formatter).await,
        Commands::Status { health } => cmd_status(&cli, health, &formatter).await,
        Commands::Drift => cmd_drift(&cli, &formatter).await,
        Commands::Graph { dot } => cmd_graph(&cli, dot, &formatter),
        Commands::State { ref command } => cmd_state(&cli, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new taskstack project in: {}", path.display());

    let config_path = path.join("taskstack.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/taskstack.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.contains(STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# taskstack")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Store the database password in SSM, or set it in .env");
    eprintln!("  2. Edit taskstack.deploy.yaml (project name, region, bundle_dir)");
    eprintln!("  3. Run 'taskstack validate' to check your configuration");
    eprintln!("  4. Run 'taskstack plan' to see what will be created");
    eprintln!("  5. Run 'taskstack apply' to provision the stack");

    Ok(())
}

/// Validate configuration and plan.
fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(cli.config.as_ref())?;
    let result = ConfigValidator::new().validate(&config)?;
    let plan = taskstack_deploy::blueprint::three_tier(&config)?;

    emit(cli.output, &formatter.format_validation(&result, &plan, show_warnings));
    Ok(())
}

/// Preview changes.
async fn cmd_plan(cli: &Cli, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let provisioner = Provisioner::new(&ctx.config, Arc::clone(&ctx.backend), &*ctx.store);

    let changes = provisioner.preview().await?;
    emit(cli.output, &formatter.format_changes(&changes, detailed));
    Ok(())
}

/// Apply the stack.
async fn cmd_apply(cli: &Cli, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let provisioner = Provisioner::new(&ctx.config, Arc::clone(&ctx.backend), &*ctx.store)
        .with_cancel(ctrl_c_signal());

    if !auto_approve {
        let changes = provisioner.preview().await?;
        eprintln!("{}", formatter.format_changes(&changes, false));
        if !changes.has_changes() {
            return Ok(());
        }
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let outcome = provisioner.apply().await?;
    emit(cli.output, &formatter.format_apply(&outcome));
    Ok(())
}

/// Destroy the stack.
async fn cmd_destroy(cli: &Cli, auto_approve: bool, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;

    let recorded: Vec<String> = ctx
        .store
        .load()
        .await?
        .map(|s| s.resources.into_keys().collect())
        .unwrap_or_default();
    if recorded.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    if !auto_approve {
        eprintln!("The following resources will be destroyed:");
        for name in &recorded {
            eprintln!("  - {name}");
        }
        if !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )? {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let provisioner = Provisioner::new(&ctx.config, Arc::clone(&ctx.backend), &*ctx.store)
        .with_cancel(ctrl_c_signal());
    let deleted = provisioner.destroy().await?;
    emit(cli.output, &formatter.format_destroyed(&deleted));
    Ok(())
}

/// Print recorded outputs.
async fn cmd_outputs(cli: &Cli, name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let provisioner = Provisioner::new(&ctx.config, Arc::clone(&ctx.backend), &*ctx.store);
    let outputs = provisioner.outputs().await?;

    match name {
        Some(name) => {
            let value = outputs.get(name).ok_or_else(|| {
                StackError::internal(format!("No output named '{name}' is recorded"))
            })?;
            print_data(&taskstack_deploy::graph::plain_string(value));
        }
        None => print_data(formatter.format_outputs(&outputs).trim_end()),
    }
    Ok(())
}

/// Show recorded resources.
async fn cmd_status(cli: &Cli, include_health: bool, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let Some(state) = ctx.store.load().await? else {
        eprintln!("No state found. Run 'taskstack apply' first.");
        return Ok(());
    };

    let health = if include_health {
        match state.outputs.get("apiIp").and_then(|o| o.value.as_str()) {
            Some(ip) => {
                let url = HealthChecker::api_url(ip, ctx.config.api.port, &ctx.config.api.health_path);
                Some(HealthChecker::new()?.check(&url).await)
            }
            None => {
                warn!("No apiIp output recorded; skipping health check");
                None
            }
        }
    } else {
        None
    };

    emit(cli.output, &formatter.format_status(&state, health.as_ref()));
    Ok(())
}

/// Check for drift.
async fn cmd_drift(cli: &Cli, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let provisioner = Provisioner::new(&ctx.config, Arc::clone(&ctx.backend), &*ctx.store);

    let report = provisioner.check_drift().await?;
    emit(cli.output, &formatter.format_drift(&report));
    Ok(())
}

/// Print the dependency graph.
fn cmd_graph(cli: &Cli, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(cli.config.as_ref())?;
    let plan = taskstack_deploy::blueprint::three_tier(&config)?;
    let order = plan.apply_order()?;

    print_data(formatter.format_graph(&plan, &order, dot).trim_end());
    Ok(())
}

/// State management commands.
async fn cmd_state(cli: &Cli, command: &StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let ctx = load_context(cli).await?;
    let store = &ctx.store;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(cli.output, &formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store
                .acquire_lock(holder.as_deref().unwrap_or(""), "manual")
                .await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if *force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked (was held by {}).", lock_info.holder);
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env`, the configuration file and environment overrides.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let config_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&config_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, config_dir))
}

/// Loads configuration and opens the backend and state store it asks for.
async fn load_context(cli: &Cli) -> Result<Context> {
    let (config, config_dir) = load_config(cli.config.as_ref())?;
    ConfigValidator::new().validate(&config)?;

    let (backend, store): (Arc<dyn CloudBackend>, Box<dyn StateStore>) = match cli.backend {
        BackendKind::Aws => (
            Arc::new(AwsBackend::new(&config.project.region).await),
            open_store(&config, &config_dir).await?,
        ),
        BackendKind::Memory => {
            info!("Using the in-memory backend; nothing will be created");
            let mut backend = MemoryBackend::new(config.project.region.clone());
            if let SecretSource::SsmParameter(name) = &config.database.password {
                backend = backend.with_secret(name.clone(), "rehearsal-password");
            }
            (Arc::new(backend), Box::new(MemoryStateStore::new()))
        }
    };
    debug!(
        "Backend: {}, state: {}",
        backend.backend_type(),
        store.backend_type()
    );

    Ok(Context {
        config,
        backend,
        store,
    })
}

/// Cancellation signal fired by Ctrl-C.
fn ctrl_c_signal() -> CancelSignal {
    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing in-flight operations...");
            handle.cancel();
        }
    });
    signal
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes formatted output: JSON to stdout, text to stderr.
fn emit(format: OutputFormat, text: &str) {
    match format {
        OutputFormat::Json => print_data(text),
        OutputFormat::Text => eprintln!("{text}"),
    }
}

/// Writes machine-readable data to stdout.
#[allow(clippy::print_stdout)]
fn print_data(text: &str) {
    println!("{text}");
}

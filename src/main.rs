//! infra-converge CLI entrypoint.
//!
//! This is the main entrypoint for the infra-converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use infra_converge::cli::{
    Cli, Commands, LogFormat, OutputFormatter, RefreshCommands, TagCommands,
};
use infra_converge::config::{
    find_config_file, ConfigParser, ConfigValidator, ConvergeConfig, ObjectStoreBackend,
};
use infra_converge::error::{ConfigError, Result};
use infra_converge::provider::{ProviderClients, RetryPolicy, S3ObjectStore, SimulatedProvider};
use infra_converge::reconciler::Reconciler;
use infra_converge::tags::Tags;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
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

/// Loaded configuration plus everything needed to talk to the provider.
struct Session {
    config: ConvergeConfig,
    parser: ConfigParser,
    provider: Arc<SimulatedProvider>,
    clients: ProviderClients,
}

impl Session {
    /// Builds a reconciler over this session.
    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.config, &self.clients).with_parser(self.parser.clone())
    }

    /// Persists the simulated provider snapshot.
    async fn save(&self) -> Result<()> {
        self.provider.save().await
    }
}

/// Main async entry point. Returns false when the command ran but failed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Plan => cmd_plan(cli.config.as_ref(), &formatter).await,
        Commands::Reconcile { pool } => cmd_reconcile(cli.config.as_ref(), pool, &formatter).await,
        Commands::Delete { yes } => cmd_delete(cli.config.as_ref(), yes, &formatter).await,
        Commands::Refresh { command } => cmd_refresh(cli.config.as_ref(), command, &formatter).await,
        Commands::Register { instance_id } => {
            cmd_registration(cli.config.as_ref(), &instance_id, true, &formatter).await
        }
        Commands::Deregister { instance_id } => {
            cmd_registration(cli.config.as_ref(), &instance_id, false, &formatter).await
        }
        Commands::Prune { template } => cmd_prune(cli.config.as_ref(), &template, &formatter).await,
        Commands::Tags { command } => cmd_tags(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    // Report every problem, not only the first
    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&config, &result, show_warnings))?;

    Ok(result.is_valid())
}

/// Report drift without changing anything.
async fn cmd_plan(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<bool> {
    let session = open_session(config_path).await?;
    let reconciler = session.reconciler();

    let report = reconciler.check_drift(&reconciler.context()).await?;
    emit(&formatter.format_drift(&report))?;

    Ok(true)
}

/// Converge the cluster, or a single machine pool.
async fn cmd_reconcile(
    config_path: Option<&PathBuf>,
    pool: Option<String>,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;
    let reconciler = session.reconciler();
    let ctx = reconciler.context();

    let result = match pool {
        None => reconciler.reconcile(&ctx).await,
        Some(name) => {
            let pool = session
                .config
                .machine_pool(&name)
                .ok_or_else(|| ConfigError::UnknownReference {
                    resource_type: String::from("machine pool"),
                    name: name.clone(),
                })?;
            reconciler.reconcile_machine_pool(&ctx, pool).await
        }
    };

    session.save().await?;
    emit(&formatter.format_reconciliation(&result))?;

    Ok(result.success)
}

/// Delete every managed resource.
async fn cmd_delete(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;

    // Confirm
    if !auto_approve {
        eprint!(
            "This will delete every resource owned by cluster '{}'. Continue? [y/N]: ",
            session.config.cluster.name
        );
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Delete cancelled.");
            return Ok(true);
        }
    }

    let reconciler = session.reconciler();
    let result = reconciler.delete_cluster(&reconciler.context()).await;

    session.save().await?;
    emit(&formatter.format_reconciliation(&result))?;

    Ok(result.success)
}

/// Instance refresh commands.
async fn cmd_refresh(
    config_path: Option<&PathBuf>,
    command: RefreshCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;
    let reconciler = session.reconciler();

    match command {
        RefreshCommands::Status { pool } => {
            let refreshes = reconciler.refreshes();
            let state = refreshes.refresh_state(&pool).await?;
            let latest = refreshes.latest_refresh(&pool).await?;
            let decision = refreshes.can_start(&pool).await?;

            emit(&formatter.format_refresh(&pool, state, latest.as_ref(), decision))?;
        }
    }

    Ok(true)
}

/// Register or deregister an instance with the API-server load balancer.
async fn cmd_registration(
    config_path: Option<&PathBuf>,
    instance_id: &str,
    register: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;
    let reconciler = session.reconciler();
    let target = reconciler.api_server_target().await?;

    let outcome = if register {
        reconciler.registration().register(instance_id, &target).await?
    } else {
        reconciler.registration().deregister(instance_id, &target).await?
    };

    session.save().await?;
    emit(&formatter.format_registration(instance_id, outcome))?;

    Ok(true)
}

/// Delete launch template versions outside the retention set.
async fn cmd_prune(
    config_path: Option<&PathBuf>,
    template: &str,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;
    let reconciler = session.reconciler();

    let Some(template_id) = reconciler.templates().get_launch_template_id(template).await? else {
        warn!(template = %template, "Launch template not found, nothing to prune");
        return Ok(false);
    };

    let report = reconciler.templates().prune_versions(&template_id).await?;

    session.save().await?;
    emit(&formatter.format_prune(template, &report))?;

    Ok(true)
}

/// Tag commands.
async fn cmd_tags(
    config_path: Option<&PathBuf>,
    command: TagCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let session = open_session(config_path).await?;

    match command {
        TagCommands::Diff {
            resource_id,
            role,
            name,
        } => {
            let ctx = session.reconciler().context();
            let observed = session
                .clients
                .retry
                .run("DescribeTags", || session.clients.tagging.describe_tags(&resource_id))
                .await?;
            let desired = ctx.owned_tags(&role, name.as_deref().unwrap_or(&resource_id), &Tags::new());
            let diff = ctx.tag_engine().diff(&desired, &observed);

            emit(&formatter.format_tag_diff(&resource_id, &diff))?;
        }
    }

    Ok(true)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Resolve configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Builds a parser rooted at the config file's directory.
fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_dir(config_file))
}

/// Directory holding the config file.
fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads and validates the configuration, then opens the provider.
async fn open_session(config_path: Option<&PathBuf>) -> Result<Session> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    let validation = ConfigValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let snapshot = config_dir(&config_file).join(&config.provider.snapshot);
    let mut provider = SimulatedProvider::open(&snapshot).await?;
    if let Some(region) = &config.cluster.region {
        provider = provider.with_region(region.clone());
    }
    let provider = Arc::new(provider);

    let mut clients = ProviderClients::simulated(Arc::clone(&provider))
        .with_retry(RetryPolicy::from(&config.retry));
    if let Some(store) = &config.object_store
        && store.backend == ObjectStoreBackend::S3
    {
        let region = store.region.as_deref().or(config.cluster.region.as_deref());
        info!(bucket = %store.bucket, "Using S3 object store");
        clients = clients.with_object_store(Arc::new(S3ObjectStore::new(region).await));
    }

    Ok(Session {
        config,
        parser,
        provider,
        clients,
    })
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

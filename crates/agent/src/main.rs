//! agent — remote-control agent supervisor
//!
//! Loads agent configuration, resolves the set of projects to run, and
//! starts one project runtime per project. Only `start` is implemented in
//! depth; the remaining CLI surface is thin stubs so the binary is
//! runnable end to end.

use agent_proto::ProjectRegistration;
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "agent")]
#[command(about = "Remote-control agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register and run one project runtime per configured project
    Start(StartArgs),
    /// Browser-assisted login flow
    Login,
    /// Register an additional project
    AddProject,
    /// Interactively edit agent configuration
    Configure,
    /// Remove a registered project
    RemoveProject,
    /// Print current agent/project status
    Status,
    /// Set the agent's response locale
    SetLanguage,
    /// Set a project's working directory
    SetProjectDir,
}

#[derive(clap::Args)]
struct StartArgs {
    #[arg(long)]
    token: Option<String>,
    #[arg(long = "api-url")]
    api_url: Option<String>,
    #[arg(long = "poll-interval")]
    poll_interval: Option<u64>,
    #[arg(long = "heartbeat-interval")]
    heartbeat_interval: Option<u64>,
    #[arg(short, long)]
    verbose: bool,
    #[arg(long = "no-auto-update")]
    no_auto_update: bool,
    #[arg(long = "update-channel", default_value = "latest")]
    update_channel: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = matches!(&cli.command, Commands::Start(args) if args.verbose);
    init_tracing(verbose)?;

    match cli.command {
        Commands::Start(args) => {
            if let Err(e) = run_start(args).await {
                error!(error = %e, "fatal configuration error");
                std::process::exit(1);
            }
        }
        Commands::Login => stub("login"),
        Commands::AddProject => stub("add-project"),
        Commands::Configure => stub("configure"),
        Commands::RemoveProject => stub("remove-project"),
        Commands::Status => stub("status"),
        Commands::SetLanguage => stub("set-language"),
        Commands::SetProjectDir => stub("set-project-dir"),
    }

    Ok(())
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_directive = if verbose { "agent=debug" } else { "agent=info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(default_directive.parse()?))
        .init();
    Ok(())
}

fn stub(name: &str) {
    println!("`{name}` is not implemented by this build; use `start` to run the agent.");
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    debug!(
        no_auto_update = args.no_auto_update,
        update_channel = %args.update_channel,
        "auto-updater is out of scope, flags accepted and ignored"
    );

    let config_dir = agent_config::resolve_config_dir();
    let (projects, preferred_chat_mode) = resolve_projects(&args, &config_dir)?;
    if projects.is_empty() {
        anyhow::bail!("no configured projects and no AGENT_TOKEN/AGENT_API_URL fallback");
    }

    let agent_version = env!("CARGO_PKG_VERSION").to_string();
    let poll_interval_ms = args.poll_interval.unwrap_or(agent_runtime::DEFAULT_POLL_INTERVAL_MS);
    let heartbeat_interval_ms = args.heartbeat_interval.unwrap_or(agent_runtime::DEFAULT_HEARTBEAT_INTERVAL_MS);

    let mut handles = Vec::with_capacity(projects.len());
    for project in projects {
        validate_api_url(&project.api_url)?;
        info!(project_code = %project.project_code, api_url = %project.api_url, "starting project runtime");

        let config = agent_runtime::RuntimeConfig {
            project_code: project.project_code,
            token: project.token,
            api_url: project.api_url,
            agent_version: agent_version.clone(),
            poll_interval_ms,
            heartbeat_interval_ms,
            preferred_chat_mode: preferred_chat_mode.clone(),
        };
        let runtime = agent_runtime::ProjectRuntime::new(config, &config_dir);
        handles.push(runtime.start());
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping project runtimes");
    for handle in handles {
        handle.stop().await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Selection rules (§4.7): CLI token+URL wins outright; otherwise load
/// config, falling back to a single `AGENT_TOKEN`/`AGENT_API_URL`
/// synthetic project only when no config file exists yet.
fn resolve_projects(args: &StartArgs, config_dir: &Path) -> anyhow::Result<(Vec<ProjectRegistration>, Option<String>)> {
    if let (Some(token), Some(api_url)) = (&args.token, &args.api_url) {
        return Ok((
            vec![ProjectRegistration {
                project_code: "cli-direct".to_string(),
                token: token.clone(),
                api_url: api_url.clone(),
                project_dir: None,
            }],
            None,
        ));
    }

    match agent_config::load(config_dir)? {
        None => match (std::env::var("AGENT_TOKEN"), std::env::var("AGENT_API_URL")) {
            (Ok(token), Ok(api_url)) => {
                let config = agent_config::synthetic_single_project("env-default", token, api_url);
                Ok((config.projects, config.agent_chat_mode))
            }
            _ => Ok((Vec::new(), None)),
        },
        Some(mut config) => {
            agent_config::touch_last_connected(config_dir, &mut config)?;
            Ok((config.projects, config.agent_chat_mode))
        }
    }
}

fn validate_api_url(raw: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid api-url {raw}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => anyhow::bail!("api-url {raw} must use http or https, got {other}"),
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, watching SIGINT only");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

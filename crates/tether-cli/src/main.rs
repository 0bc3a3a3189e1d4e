mod config;
mod prompt_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use tether_core::hooks::{self, HookPaths};

use config::{Overrides, PermissionArg, TetherConfig, TransportArg};
use prompt_cmd::PromptOptions;

#[derive(Parser)]
#[command(name = "tether", about = "Drive the cursor-agent CLI as an ACP agent")]
struct Cli {
    /// Config file (overrides TETHER_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path or name of the cursor-agent binary
    #[arg(long, global = true)]
    agent_binary: Option<String>,

    /// Cursor API key; skips the login check
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Workspace directory the agent runs in
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Transport for the hook server
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportArg>,

    /// Decision used when a permission hook cannot be answered
    #[arg(long, global = true, value_enum)]
    default_permission: Option<PermissionArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a tether config file with default settings
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Send one prompt to the agent and stream the reply
    Prompt {
        /// Prompt text (read from stdin when omitted)
        text: Option<String>,
        /// Model to use for this prompt
        #[arg(long)]
        model: Option<String>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show agent CLI version and login state
    Status,
    /// List models the agent can use
    Models,
    /// List previous agent chats
    Sessions,
    /// Restore hook files left behind by an interrupted run
    RestoreHooks {
        /// Hook directory (defaults to <cwd>/.cursor)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            config_path: self.config.clone(),
            binary: self.agent_binary.clone(),
            api_key: self.api_key.clone(),
            working_dir: self.cwd.clone(),
            transport: self.transport,
            default_permission: self.default_permission,
        }
    }
}

fn cmd_init(overrides: &Overrides, force: bool) -> anyhow::Result<()> {
    let path = config::config_path(overrides.config_path.as_deref());

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&path, &cfg)?;

    println!("Config written to {}", path.display());
    println!("  bridge.connection.binary_path = {}", cfg.bridge.connection.binary_path);
    println!("  bridge.ipc.default_permission = {:?}", cfg.bridge.ipc.default_permission);
    Ok(())
}

fn cmd_restore_hooks(resolved: &TetherConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let paths = match dir.or_else(|| resolved.bridge.harness.hooks_dir.clone()) {
        Some(dir) => HookPaths::in_dir(dir),
        None => {
            let workspace = match &resolved.bridge.connection.working_dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("failed to determine the working directory")?,
            };
            HookPaths::for_workspace(&workspace)
        }
    };

    if hooks::recover(&paths).context("failed to restore hook files")? {
        println!("Restored hook files in {}", paths.dir.display());
    } else {
        println!("Nothing to restore in {}", paths.dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries agent output, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = cli.overrides();

    let mut stdout = std::io::stdout();

    match cli.command {
        Commands::Init { force } => cmd_init(&overrides, force),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tether", &mut stdout);
            Ok(())
        }
        Commands::Prompt { text, model, json } => {
            let resolved = resolve(&overrides)?;
            prompt_cmd::run_prompt(resolved.bridge, PromptOptions { text, model, json }).await
        }
        Commands::Status => {
            let resolved = resolve(&overrides)?;
            if !resolved.from_file {
                println!("Config: {} (not found, using defaults)", resolved.path.display());
            }
            status_cmd::run_status(&resolved.bridge, &mut stdout).await
        }
        Commands::Models => status_cmd::run_models(&resolve(&overrides)?.bridge, &mut stdout).await,
        Commands::Sessions => {
            status_cmd::run_sessions(&resolve(&overrides)?.bridge, &mut stdout).await
        }
        Commands::RestoreHooks { dir } => cmd_restore_hooks(&resolve(&overrides)?, dir),
    }
}

fn resolve(overrides: &Overrides) -> anyhow::Result<TetherConfig> {
    let resolved = TetherConfig::resolve(overrides)?;
    tracing::debug!(
        path = %resolved.path.display(),
        from_file = resolved.from_file,
        "configuration resolved"
    );
    Ok(resolved)
}

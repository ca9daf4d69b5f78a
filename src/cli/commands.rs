//! CLI command definitions for code-sandbox.
//!
//! `serve` (the default) speaks the stdio tool protocol, `run` executes one
//! file or snippet directly, and `languages` lists what is configured.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{find_config_path, ConfigManager, CONFIG_ENV};
use crate::execution::{ContainerProvider, DockerClient};
use crate::sandbox::{template, SandboxFactory};
use crate::server::tool::{execute_request, ExecuteArgs};
use crate::server::ToolServer;

/// Run code snippets inside disposable Docker containers.
#[derive(Parser, Debug)]
#[command(name = "code-sandbox")]
#[command(about = "Run code snippets inside disposable Docker containers")]
#[command(version)]
#[command(
    long_about = "code-sandbox runs untrusted code snippets in throwaway Docker containers with CPU, memory, disk and network limits.\n\nWithout a subcommand it serves the `execute_code_in_sandbox` tool over stdio.\n\nExample usage:\n  code-sandbox run --language python --code 'print(1+1)'"
)]
pub struct Cli {
    /// The subcommand to execute. Defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the YAML configuration file.
    #[arg(short, long, env = CONFIG_ENV, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Serve the sandbox tool over stdin/stdout.
    Serve(ServeArgs),

    /// Execute one snippet and print its output.
    #[command(alias = "exec")]
    Run(RunArgs),

    /// List configured languages.
    Languages(LanguagesArgs),
}

/// Arguments for `code-sandbox serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Seconds between configuration file checks. 0 disables hot reload.
    #[arg(long, default_value = "5")]
    pub watch_interval: u64,
}

/// Arguments for `code-sandbox run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Language to run.
    #[arg(short = 'L', long)]
    pub language: String,

    /// Language version. Defaults to the configured default_version.
    #[arg(long)]
    pub version: Option<String>,

    /// Source file to run. Use `-` for stdin.
    #[arg(short, long, conflicts_with = "code")]
    pub file: Option<PathBuf>,

    /// Inline source code.
    #[arg(long)]
    pub code: Option<String>,

    /// Output the full result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `code-sandbox languages`.
#[derive(Parser, Debug)]
pub struct LanguagesArgs {
    /// Output as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without executing.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config)?;

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => run_serve_command(config, args).await,
        Commands::Run(args) => run_run_command(config, args).await,
        Commands::Languages(args) => run_languages_command(config, args),
    }
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self { watch_interval: 5 }
    }
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<ConfigManager> {
    let path = find_config_path(explicit.as_deref());
    ConfigManager::load(path).context("Failed to load configuration")
}

async fn docker_factory() -> anyhow::Result<(DockerClient, SandboxFactory)> {
    let client = DockerClient::connect()
        .await
        .context("Docker is unavailable; start the daemon or set DOCKER_HOST")?;
    let provider = ContainerProvider::new(Arc::new(client.clone()));
    Ok((client, SandboxFactory::new().with_provider(Arc::new(provider))))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            token.cancel();
        }
    });
}

// ============================================================================
// Serve
// ============================================================================

async fn run_serve_command(config: ConfigManager, args: ServeArgs) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let (client, factory) = docker_factory().await?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let watcher_token = CancellationToken::new();
    let watcher = (args.watch_interval > 0 && config.path().is_some()).then(|| {
        config.watch(
            Duration::from_secs(args.watch_interval),
            watcher_token.clone(),
        )
    });

    let settings = config.snapshot();
    info!(
        name = %settings.server.name,
        engine = %settings.runtimes.engine,
        languages = settings.languages.0.len(),
        "Serving sandbox tool on stdio"
    );

    let server = Arc::new(ToolServer::new(Arc::clone(&config), factory));
    let served = server
        .serve(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown,
        )
        .await;

    watcher_token.cancel();
    if let Some(handle) = watcher {
        if let Err(e) = handle.await {
            warn!(error = %e, "Config watcher task failed");
        }
    }

    if config.snapshot().runtimes.cleanup_on_exit {
        match client.remove_managed_containers().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Removed leftover sandbox containers"),
            Err(e) => warn!(error = %e, "Failed to prune sandbox containers"),
        }
    }

    served.context("Tool server I/O failed")
}

// ============================================================================
// Run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunOutput {
    language: String,
    stdout: String,
    stderr: String,
    exit_code: i64,
    duration_ms: u64,
}

fn read_source(args: &RunArgs) -> anyhow::Result<String> {
    match (&args.code, &args.file) {
        (Some(code), _) => Ok(code.clone()),
        (None, Some(path)) if path.as_os_str() == "-" => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, None) => Err(anyhow::anyhow!("Provide the code with --code or --file")),
    }
}

async fn run_run_command(config: ConfigManager, args: RunArgs) -> anyhow::Result<()> {
    let code = read_source(&args)?;
    let (_client, factory) = docker_factory().await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let request = ExecuteArgs {
        language: args.language.clone(),
        code,
        version: args.version.clone(),
    };
    let settings = config.snapshot();
    let result = execute_request(&settings, &factory, &request, &cancel).await?;

    if args.json {
        let output = RunOutput {
            language: args.language,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
    }

    if result.exit_code != 0 {
        std::process::exit(i32::try_from(result.exit_code).unwrap_or(1));
    }
    Ok(())
}

// ============================================================================
// Languages
// ============================================================================

#[derive(Debug, Serialize)]
struct LanguageEntry {
    language: String,
    default_version: Option<String>,
    image: String,
    suffix: String,
}

fn run_languages_command(config: ConfigManager, args: LanguagesArgs) -> anyhow::Result<()> {
    let settings = config.snapshot();
    let entries: Vec<LanguageEntry> = settings
        .languages
        .0
        .iter()
        .map(|(name, lang)| {
            let image = lang
                .default_version
                .as_deref()
                .and_then(|v| template::resolve_image(&lang.image, name, v).ok())
                .unwrap_or_else(|| lang.image.clone());
            LanguageEntry {
                language: name.clone(),
                default_version: lang.default_version.clone(),
                image,
                suffix: lang.suffix.clone(),
            }
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("{:<12} {:<10} {:<8} IMAGE", "LANGUAGE", "VERSION", "SUFFIX");
    for entry in &entries {
        println!(
            "{:<12} {:<10} {:<8} {}",
            entry.language,
            entry.default_version.as_deref().unwrap_or("-"),
            entry.suffix,
            entry.image
        );
    }
    Ok(())
}

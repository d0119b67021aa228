//! Sandbox Engine CLI
//!
//! Run scripts locally and inspect configuration.

use clap::{Parser, Subcommand};
use console::style;
use sandbox_engine::capabilities::{CapabilityId, CapabilityRegistry, REGISTRY_VERSION};
use sandbox_engine::config::{self, validate_config, Config};
use sandbox_engine::sandbox::ExecutionRequest;
use sandbox_engine::service::{initialize_sandbox_service, shutdown_sandbox_service};
use sandbox_engine::{Error, Result, VERSION};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sandbox-engine",
    author = "Sandbox Engine Contributors",
    version = VERSION,
    about = "Sandbox Engine - isolated script execution",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script file in a fresh isolate and print the result as JSON
    Run {
        /// Script file, or `-` to read from stdin
        file: PathBuf,

        /// Execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// JSON value exposed to the script as `context`
        #[arg(long)]
        context: Option<String>,

        /// Restrict the script to these capabilities (repeatable)
        #[arg(long = "capability", short = 'c')]
        capabilities: Vec<String>,
    },

    /// List the capabilities scripts can call
    Capabilities,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_engine=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            timeout_ms,
            context,
            capabilities,
        } => run_script(file, timeout_ms, context, capabilities).await?,
        Commands::Capabilities => list_capabilities()?,
        Commands::Config { action } => manage_config(action)?,
    }
    Ok(())
}

// ============================================================================
// Script Execution
// ============================================================================

async fn run_script(
    file: PathBuf,
    timeout_ms: Option<u64>,
    context: Option<String>,
    capabilities: Vec<String>,
) -> Result<()> {
    let code = if file.as_os_str() == "-" {
        let mut code = String::new();
        std::io::stdin().read_to_string(&mut code)?;
        code
    } else {
        std::fs::read_to_string(&file)
            .map_err(|e| Error::InvalidInput(format!("Cannot read {}: {}", file.display(), e)))?
    };

    let context = match context {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidInput(format!("--context is not valid JSON: {}", e)))?,
        None => serde_json::Value::Null,
    };

    let mut request = ExecutionRequest::new(code).with_context(context);
    if let Some(timeout_ms) = timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }
    if !capabilities.is_empty() {
        let ids = capabilities
            .iter()
            .map(|name| name.parse::<CapabilityId>())
            .collect::<Result<Vec<_>>>()?;
        request = request.with_capabilities(ids);
    }

    // One script needs one worker
    let mut config = Config::from_env()?;
    config.sandbox.pool_size = 1;
    config.sandbox.prewarm_workers = Some(0);

    let service = initialize_sandbox_service(&config)?;
    let outcome = service.submit(request).await;
    shutdown_sandbox_service(service).await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn list_capabilities() -> Result<()> {
    let config = Config::from_env()?;
    let registry = CapabilityRegistry::from_config(&config.capabilities)?;

    println!(
        "{} (registry v{})",
        style("Capabilities").cyan().bold(),
        REGISTRY_VERSION
    );
    for id in registry.ids() {
        println!(
            "  {} {}",
            style(format!("{:<12}", id.as_str())).green(),
            registry.description(id).unwrap_or_default()
        );
    }
    for id in CapabilityId::ALL.iter().filter(|id| !registry.contains(**id)) {
        println!("  {} {}", style(format!("{:<12}", id.as_str())).dim(), style("disabled").dim());
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

fn manage_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Validate => {
            let config = Config::from_env()?;
            let result = validate_config(&config);

            for issue in &result.errors {
                println!("{} {}: {}", style("✗").red(), issue.path, issue.message);
                if let Some(suggestion) = &issue.suggestion {
                    println!("    {}", style(suggestion).dim());
                }
            }
            for issue in &result.warnings {
                println!("{} {}: {}", style("!").yellow(), issue.path, issue.message);
            }

            if result.valid {
                println!("{} Configuration is valid", style("✓").green());
                Ok(())
            } else {
                Err(Error::Config(result.error_summary()))
            }
        }
        ConfigAction::Path => {
            println!("{}", config::config_path().display());
            Ok(())
        }
        ConfigAction::Init { force } => {
            let path = config::config_path();
            if path.exists() && !force {
                return Err(Error::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_config(&Config::default(), &path)?;
            println!("{} Wrote {}", style("✓").green(), path.display());
            Ok(())
        }
    }
}

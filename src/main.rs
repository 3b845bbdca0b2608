//! `sandbox-broker`: handle one broker request per process.
//!
//! The response goes to stdout; introspection notes (confirmation codes) go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sandbox_broker::{Broker, BrokerConfig, BrokerRequest, DockerRuntime, Introspector};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-broker", version, about = "Run a confirmed shell command in a session container")]
struct Cli {
    /// JSON configuration file (defaults apply when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the state directory from the configuration.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[arg(long)]
    session_id: Option<String>,

    #[arg(long)]
    project_path: Option<String>,

    #[arg(long)]
    command: Option<String>,

    #[arg(long)]
    confirmation_code: Option<String>,

    /// Remove this session's container (needs its own confirmation code).
    #[arg(long)]
    destroy_container: bool,
}

/// Prints notes to stderr, where the supervising user reads them.
struct StderrIntrospector;

impl Introspector for StderrIntrospector {
    fn note(&self, message: &str) {
        eprintln!("{message}");
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::load(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(Cli::parse()).await {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    let config = load_config(&cli)?;
    let runtime = DockerRuntime::with_binary(config.container.runtime_binary.clone())?;
    let broker = Broker::new(config, Arc::new(runtime), Arc::new(StderrIntrospector));
    let request = BrokerRequest {
        session_id: cli.session_id,
        project_path: cli.project_path,
        command: cli.command,
        confirmation_code: cli.confirmation_code,
        destroy_container: cli.destroy_container,
    };
    let response = broker.handle(request).await?;
    Ok(response.to_string())
}

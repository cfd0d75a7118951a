use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use persona_pilot::face;
use persona_pilot::{
    AgentConfig, Brain, ChromeProvider, ControlCommand, InMemoryJobRegistry, JobEvent, JobRequest,
    JobStatus, Orchestrator,
};

const DEFAULT_FILTER: &str = "info,persona_pilot=info";

#[derive(Parser)]
#[command(name = "agent")]
#[command(version, about = "Persona-driven browser agent")]
struct Cli {
    /// Config file (defaults to <config dir>/persona-pilot/config.toml)
    #[arg(short, long, global = true, env = "PILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the web UI and job API (default)
    Serve {
        #[arg(long)]
        bind: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
    /// Run a single job in the foreground, printing its events as JSON lines
    Run {
        #[arg(long)]
        url: String,

        #[arg(long)]
        goal: String,

        #[arg(long)]
        persona: Option<String>,

        #[arg(long)]
        steps: Option<usize>,

        /// Attach base64 screenshots to each step
        #[arg(long)]
        debug: bool,

        #[arg(long)]
        headed: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        port: None,
        headed: false,
    }) {
        Commands::Serve { bind, port, headed } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if headed {
                config.browser.headless = false;
            }
            let orchestrator = build(&config)?;
            tracing::info!(personas = ?orchestrator.personas().names(), "agent ready");
            face::serve(orchestrator, &config.server).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            url,
            goal,
            persona,
            steps,
            debug,
            headed,
        } => {
            if headed {
                config.browser.headless = false;
            }
            let orchestrator = build(&config)?;
            let request = JobRequest {
                url,
                goal,
                persona,
                max_steps: steps,
                debug,
            };
            run_foreground(&orchestrator, request).await
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    // stderr keeps stdout clean for `run` output.
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build(config: &AgentConfig) -> Result<Orchestrator> {
    let brain = Brain::new(&config.llm).context("set OPENAI_API_KEY or llm.api_key")?;
    let browsers = ChromeProvider::new(
        config.browser.clone(),
        config.scoring.consent_keywords.clone(),
    );
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(brain),
        Arc::new(browsers),
        Arc::new(InMemoryJobRegistry::new()),
    )?;
    Ok(orchestrator)
}

async fn run_foreground(orchestrator: &Orchestrator, request: JobRequest) -> Result<ExitCode> {
    let job_id = orchestrator.submit(request)?;
    let mut events = orchestrator.attach(job_id)?;
    let mut final_status = JobStatus::Running;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let JobEvent::Status { status, .. } = event {
                    final_status = status;
                    if status.is_terminal() {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, stopping job");
                orchestrator.control(job_id, ControlCommand::Stop)?;
            }
        }
    }

    Ok(match final_status {
        JobStatus::Error => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

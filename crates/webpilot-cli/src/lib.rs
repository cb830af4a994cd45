use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use webpilot_browser::{BrowserGateway, GatewayConfig, SessionGovernor, SessionLimits};
use webpilot_config::Config;
use webpilot_core::{Agent, TaskError};
use webpilot_providers::{AnthropicProvider, ChatProvider, OpenAiProvider, ProviderRegistry};

mod ui_writer_impl;
use ui_writer_impl::ConsoleUiWriter;

const DEFAULT_SYSTEM_INSTRUCTIONS: &str = "You are an autonomous browser agent. \
You complete the task you are given by driving a real browser through the \
available tools, one action at a time. Observe the page before acting, act, \
then verify the result. When the task is done, reply with a short summary in \
plain text and no tool calls.";

#[derive(Parser, Clone)]
#[command(name = "webpilot")]
#[command(about = "An autonomous browser-driving agent")]
#[command(version)]
pub struct Cli {
    /// Task to execute
    pub task: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Override the configured provider (anthropic, openai)
    #[arg(long, value_name = "PROVIDER")]
    pub provider: Option<String>,

    /// Override the model for the selected provider
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Override the maximum number of model turns for this task
    #[arg(long, value_name = "N")]
    pub max_turns: Option<usize>,

    /// Override the system instructions sent ahead of the task
    #[arg(long, value_name = "TEXT")]
    pub instructions: Option<String>,

    /// Ask the model for a completion verdict after the task finishes
    #[arg(long)]
    pub check: bool,

    /// Wall-clock deadline in minutes; observed between turns
    #[arg(long, value_name = "MINUTES")]
    pub deadline: Option<u64>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let mut config = Config::load_with_overrides(
        cli.config.as_deref(),
        cli.provider.clone(),
        cli.model.clone(),
    )?;
    if let Some(max_turns) = cli.max_turns {
        config.agent.max_turns = max_turns;
    }

    let task = cli
        .task
        .clone()
        .context("no task given; pass one as the first argument")?;

    let registry = build_registry(&config)?;
    let provider = registry.get(None)?;
    info!(
        "Using provider {} with model {}",
        provider.name(),
        provider.model()
    );

    let gateway = BrowserGateway::new(GatewayConfig {
        command: config.browser.command.clone(),
        args: config.browser.args.clone(),
        output_dir: PathBuf::from(&config.browser.output_dir),
        request_timeout: Duration::from_secs(config.browser.request_timeout_seconds),
    });
    let limits = SessionLimits {
        max_pages: config.session.max_pages,
        restart_after_pages: config.session.restart_after_pages,
        idle_tab_timeout: Duration::from_secs(config.session.idle_tab_timeout_seconds),
    };
    let session = SessionGovernor::new(gateway, limits, config.browser.blocked_tools.clone());
    session
        .connect()
        .await
        .context("could not start the browser automation server")?;

    let instructions = cli
        .instructions
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTIONS.to_string());

    let mut agent = Agent::new(provider, session, config, ConsoleUiWriter::new());

    let cancellation_token = CancellationToken::new();
    if let Some(minutes) = cli.deadline {
        let token = cancellation_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            info!("Deadline of {} minutes reached, stopping after this turn", minutes);
            token.cancel();
        });
    }

    let outcome = agent
        .run_task_cancellable(&task, &instructions, cancellation_token)
        .await;

    match outcome {
        Ok(result) => {
            println!();
            println!("{}", result.response);
            if cli.check {
                let complete = agent.check_if_complete(&task).await;
                println!(
                    "Completion check: {}",
                    if complete { "complete" } else { "not complete" }
                );
            }
            println!("{}", agent.stats());
            agent.session().close().await.ok();
            Ok(())
        }
        Err(e) => {
            error!("Task failed: {}", e);
            println!("{}", agent.stats());
            agent.session().close().await.ok();
            match e {
                TaskError::Cancelled => {
                    // Controlled exit on deadline; partial stats already shown
                    Ok(())
                }
                other => Err(other.into()),
            }
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("webpilot_core={}", level).parse().unwrap())
        .add_directive(format!("webpilot_cli={}", level).parse().unwrap())
        .add_directive(format!("webpilot_browser={}", level).parse().unwrap())
        .add_directive(format!("webpilot_providers={}", level).parse().unwrap());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn build_registry(config: &Config) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    if let Some(anthropic) = &config.providers.anthropic {
        let provider = AnthropicProvider::new(
            anthropic.api_key.clone(),
            Some(anthropic.model.clone()),
            anthropic.max_tokens,
            anthropic.temperature,
        )?;
        registry.register(Arc::new(provider) as Arc<dyn ChatProvider>);
    }

    if let Some(openai) = &config.providers.openai {
        let provider = OpenAiProvider::new(
            openai.api_key.clone(),
            openai.model.clone(),
            openai.base_url.clone(),
            openai.max_tokens,
            openai.temperature,
        )?;
        registry.register(Arc::new(provider) as Arc<dyn ChatProvider>);
    }

    registry
        .set_default(&config.providers.default_provider)
        .with_context(|| {
            format!(
                "default provider '{}' is not configured",
                config.providers.default_provider
            )
        })?;

    Ok(registry)
}

//! Session bridge CLI
//!
//! Headless monitor: connects one workspace, runs a single prompt and prints
//! every domain event as one JSON line on stdout.

use clap::Parser;
use futures::StreamExt;
use session_bridge::events::DomainEvent;
use session_bridge::{ApprovalDecision, BridgeConfig, BridgeEvent, WorkspaceManager};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Session bridge - drive an agent backend and stream its events
#[derive(Parser, Debug)]
#[command(name = "session-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Workspace directory the agent runs in
    #[arg(short = 'C', long, default_value = ".")]
    cwd: PathBuf,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent executable, overriding the config file
    #[arg(long)]
    agent_bin: Option<String>,

    /// Accept approval requests instead of declining them
    #[arg(long)]
    approve: bool,

    /// Verbose logging on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Prompt to send
    #[arg(trailing_var_arg = true, required = true)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = match cli.config.clone().or_else(BridgeConfig::default_path) {
        Some(path) => BridgeConfig::load(&path)?,
        None => BridgeConfig::default(),
    };
    if let Some(bin) = cli.agent_bin.clone() {
        config = config.with_agent_bin(bin);
    }

    let cwd = std::fs::canonicalize(&cli.cwd)?;
    info!("Working directory: {:?}", cwd);
    info!("Agent: {} {}", config.agent_bin, config.agent_args.join(" "));

    let manager = WorkspaceManager::new(config);
    let mut events = Box::pin(manager.event_stream());

    let workspace_id = manager.add_workspace(&cwd).await?;
    let session = manager.connect(&workspace_id).await?;
    let thread_id = session.start_thread().await?;
    session.set_active_thread(Some(&thread_id)).await;

    let prompt = cli.prompt.join(" ");
    session.start_turn(&thread_id, &prompt, Vec::new()).await?;

    let mut stdout = io::stdout();
    while let Some(event) = events.next().await {
        writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        stdout.flush()?;

        let BridgeEvent::Domain { event, .. } = event else {
            continue;
        };
        match event {
            DomainEvent::ApprovalRequested { request_id, method, .. } => {
                let decision = if cli.approve {
                    ApprovalDecision::Accept
                } else {
                    ApprovalDecision::Decline
                };
                info!("{} {}: {:?}", method, request_id, decision);
                if let Err(e) = session.respond_approval(request_id, decision).await {
                    warn!("{}", e);
                }
            }
            DomainEvent::UserInputRequested {
                request_id,
                thread_id: question_thread,
                item_id,
                questions,
                ..
            } => {
                // First option when approving, otherwise no answer.
                let answers: HashMap<String, Vec<String>> = if cli.approve {
                    questions
                        .iter()
                        .filter_map(|question| {
                            let first = question.options.first()?;
                            Some((question.id.clone(), vec![first.label.clone()]))
                        })
                        .collect()
                } else {
                    HashMap::new()
                };
                let tool_use_id = item_id.unwrap_or_else(|| request_id.to_string());
                if let Err(e) = session
                    .respond_user_input(&question_thread, &tool_use_id, answers)
                    .await
                {
                    warn!("{}", e);
                }
            }
            DomainEvent::TurnCompleted {
                thread_id: completed, error, ..
            } if completed == thread_id => {
                if let Some(error) = error {
                    warn!("Turn failed: {}", error);
                }
                break;
            }
            DomainEvent::ChannelClosed { reason } => {
                warn!("Agent connection closed: {}", reason);
                break;
            }
            _ => {}
        }
    }

    manager.disconnect(&workspace_id).await?;
    Ok(())
}

//! StreamRelay - CLI entry point
//!
//! Runs the relay server and manages destinations, binding tokens and traces.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use streamrelay::agentlink::{self, AgentLink};
use streamrelay::binding::{BindingHandshake, BindingOffers, HttpDecoder};
use streamrelay::bus::{EventBus, InMemoryBus};
use streamrelay::cli::{Cli, Command, DestinationCommand, OutputFormat, TokenCommand, TraceCommand, get_log_path};
use streamrelay::config::Config;
use streamrelay::domain::{Destination, TraceRecord, TraceStatus, TraceSummary, now_ms};
use streamrelay::relay::{Relay, RelayOptions};
use streamrelay::state::{StateManager, TraceQuery};
use streamrelay::transport::sse;

/// How often stale binding offers are swept
const OFFER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first so its log-level can seed logging
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    config.validate().context("Invalid configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { bind } => cmd_serve(&config, bind).await,
        Command::Destination { command } => cmd_destination(&config, command).await,
        Command::Token { command } => cmd_token(&config, command).await,
        Command::Trace { command } => cmd_trace(&config, command).await,
        Command::Config => cmd_config(&config),
    }
}

fn open_state(config: &Config) -> Result<StateManager> {
    debug!(store_dir = %config.storage.store_dir, "open_state: called");
    StateManager::spawn(&config.storage.store_dir).context("Failed to open relay store")
}

fn format_ms(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

fn status_label(status: TraceStatus) -> ColoredString {
    match status {
        TraceStatus::Completed => status.as_str().green(),
        TraceStatus::Anomaly => status.as_str().red().bold(),
        TraceStatus::Active => status.as_str().cyan(),
        TraceStatus::Pending => status.as_str().dimmed(),
    }
}

/// Run the relay until SIGINT/SIGTERM
async fn cmd_serve(config: &Config, bind: Option<String>) -> Result<()> {
    debug!(?bind, "cmd_serve: called");
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let state = open_state(config)?;
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(config.relay.channel_capacity));

    let offers = Arc::new(BindingOffers::new(config.binding.offer_ttl()));
    let sweeper = offers.spawn_sweeper(OFFER_SWEEP_INTERVAL);
    let decoder = HttpDecoder::new(&config.binding.decoder_url, config.binding.decoder_timeout())
        .context("Failed to create optical decoder")?;
    let handshake = BindingHandshake::new(state.clone(), offers, Arc::new(decoder));
    let relay = Relay::new(state.clone(), bus.clone(), handshake, RelayOptions::from_config(config));

    // Agent socket
    let (agent_listener, socket_path) = agentlink::create_listener_at(&config.agent_link.socket_path)?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let link = AgentLink::new(state.clone(), bus.clone());
    let link_handle = tokio::spawn(link.serve(agent_listener, socket_path.clone(), async move {
        let _ = stop_rx.await;
    }));

    // SSE server
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context(format!("Failed to bind {}", bind))?;
    info!(%bind, ?socket_path, "Relay running");
    println!(
        "{} listening on {} (agents: {})",
        "StreamRelay".bold(),
        bind.cyan(),
        socket_path.display()
    );

    axum::serve(listener, sse::router(relay))
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            let _ = stop_tx.send(());
        })
        .await
        .context("Server error")?;

    info!("Relay shutting down...");
    let _ = link_handle.await;
    sweeper.abort();
    if let Err(e) = state.shutdown().await {
        warn!(error = %e, "Failed to stop state manager");
    }
    debug!("cmd_serve: shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => warn!("SIGINT received"),
                    _ = sigterm.recv() => warn!("SIGTERM received"),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to ctrl_c"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to wait for ctrl_c");
    }
}

async fn cmd_destination(config: &Config, command: DestinationCommand) -> Result<()> {
    debug!(?command, "cmd_destination: called");
    let state = open_state(config)?;

    match command {
        DestinationCommand::Create { name } => {
            let dest = Destination::new(name);
            let token = dest.agent_token.clone();
            let id = state.create_destination(dest).await?;
            println!("{} {}", "Created destination".green(), id.bold());
            println!("Agent token: {}", token);
        }
        DestinationCommand::List { format } => {
            let dests = state.list_destinations().await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&dests)?);
                return Ok(());
            }
            if dests.is_empty() {
                println!("No destinations");
                return Ok(());
            }
            let window = config.agent_link.presence_window_ms();
            let now = now_ms();
            for dest in &dests {
                let presence = if dest.is_online(now, window) {
                    "online".green()
                } else {
                    "offline".dimmed()
                };
                let binding = match (&dest.bound_user_id, &dest.bound_device_id) {
                    (Some(user), _) => format!("user {}", user).yellow(),
                    (None, Some(device)) => format!("device {}", device).yellow(),
                    (None, None) => "unbound".dimmed(),
                };
                println!("{}  {}  {}  {}", dest.id.bold(), dest.name, presence, binding);
            }
        }
        DestinationCommand::Unbind { id } => {
            let dest = state.unbind_destination(&id).await?;
            println!("{} {}", "Unbound".green(), dest.id.bold());
        }
    }
    Ok(())
}

async fn cmd_token(config: &Config, command: TokenCommand) -> Result<()> {
    debug!(?command, "cmd_token: called");
    let state = open_state(config)?;

    match command {
        TokenCommand::Issue { destination_id } => {
            let token = state
                .issue_token(&destination_id, config.binding.token_ttl_ms())
                .await?;
            println!("{}", token.token.bold());
            println!("Expires: {}", format_ms(token.expires_at));
        }
        TokenCommand::Sweep => {
            let removed = state.purge_tokens(now_ms()).await?;
            println!("Removed {} token(s)", removed);
        }
    }
    Ok(())
}

fn print_summary(summary: &TraceSummary) {
    let loss = match summary.loss_position {
        Some(position) => format!(" loss={}", position).red().to_string(),
        None => String::new(),
    };
    println!(
        "{}  {}  {}  up={}/{} down={}/{}{}  {}",
        summary.trace_id.bold(),
        status_label(summary.status),
        summary.message_id,
        summary.upstream_fragment_count,
        summary.upstream_length,
        summary.downstream_fragment_count,
        summary.downstream_length,
        loss,
        format_ms(summary.created_at).dimmed(),
    );
}

fn print_trace(trace: &TraceRecord) {
    let summary = trace.summary();
    print_summary(&summary);
    println!("Destination: {}", trace.destination_id);
    if let Some(anomaly) = &trace.anomaly {
        println!(
            "Anomaly: {} (fragment gap {}, content gap {})",
            anomaly.kind.to_string().red(),
            anomaly.fragment_gap,
            anomaly.content_gap
        );
    }
    if !trace.missing_sequences.is_empty() {
        println!("Missing sequences: {:?}", trace.missing_sequences);
    }
    if let Some(ms) = trace.first_fragment_delay_ms {
        println!("First fragment after: {} ms", ms);
    }
    if let Some(ms) = trace.avg_fragment_interval_ms {
        println!("Average interval: {:.1} ms", ms);
    }
    if trace.compensated {
        println!("{}", "Compensated from summary".yellow());
    }
    println!();
    for event in &trace.events {
        let at: Option<DateTime<Local>> = Local.timestamp_millis_opt(event.timestamp).single();
        let at = at.map(|dt| dt.format("%H:%M:%S%.3f").to_string()).unwrap_or_default();
        println!("  {}  {:<20} {}", at.dimmed(), event.event_type.to_string(), event.data);
    }
}

async fn cmd_trace(config: &Config, command: TraceCommand) -> Result<()> {
    debug!(?command, "cmd_trace: called");
    let state = open_state(config)?;

    match command {
        TraceCommand::List {
            anomalies,
            limit,
            format,
        } => {
            let query = TraceQuery {
                status: anomalies.then_some(TraceStatus::Anomaly),
                destination_id: None,
                limit: Some(limit),
            };
            let summaries: Vec<TraceSummary> = state.list_traces(query).await?.iter().map(|t| t.summary()).collect();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
                OutputFormat::Text if summaries.is_empty() => println!("No traces"),
                OutputFormat::Text => summaries.iter().for_each(print_summary),
            }
        }
        TraceCommand::Show { trace_id } => match state.get_trace(&trace_id).await? {
            Some(trace) => print_trace(&trace),
            None => return Err(eyre::eyre!("Trace not found: {}", trace_id)),
        },
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    println!("# logs: {}", get_log_path().display());
    Ok(())
}

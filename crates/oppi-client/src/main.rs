use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::debug;
use oppi_client::config::{
    APP_NAME, ClientConfig, load_or_init_config, resolve_config_path, write_default_config,
};
use oppi_client::logging::{LogOptions, init_logging};
use oppi_client::{
    CommandEngine, CommandError, Connection, ConnectionStatus, ProgressFn, TimelineItem,
    TimelineReducer, Transport, TurnKind, WsTransport, spawn_inbound_pump,
};
use oppi_protocol::{AckStage, ServerMessage};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_tail(ctx: RuntimeContext, cmd: TailCommand) -> Result<()> {
    handle_tail(&ctx, cmd).await
}

#[tokio::main]
async fn async_prompt(ctx: RuntimeContext, cmd: PromptCommand) -> Result<()> {
    handle_prompt(&ctx, cmd).await
}

#[tokio::main]
async fn async_fork(ctx: RuntimeContext, cmd: ForkCommand) -> Result<()> {
    handle_fork(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("using config file {}", ctx.config_file.display());

    match cli.command {
        Command::Tail(cmd) => async_tail(ctx, cmd),
        Command::Prompt(cmd) => async_prompt(ctx, cmd),
        Command::Fork(cmd) => async_fork(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "oppi - resumable agent session client.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow a session and print timeline changes as JSON lines
    Tail(TailCommand),
    /// Send a message to a session
    Prompt(PromptCommand),
    /// Fork a new session from an earlier entry
    Fork(ForkCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct TailCommand {
    /// Session to follow
    session: String,
}

#[derive(Debug, Clone, Args)]
struct PromptCommand {
    /// Target session
    session: String,
    /// Message text
    message: String,
    /// Steer the running turn instead of starting a new one
    #[arg(long, conflicts_with = "follow_up")]
    steer: bool,
    /// Queue the message for after the current turn
    #[arg(long = "follow-up")]
    follow_up: bool,
}

#[derive(Debug, Clone, Args)]
struct ForkCommand {
    /// Source session
    session: String,
    /// Entry to fork from (timeline item ids are accepted)
    entry_id: String,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: ClientConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = resolve_config_path(common.config.as_deref())?;
        let config = load_or_init_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        init_logging(&LogOptions {
            quiet: self.common.quiet,
            verbose: self.common.verbose,
            debug: self.common.debug,
            trace: self.common.trace,
            json: self.common.json || self.config.logging.json,
            config_level: Some(self.config.logging.level.clone()),
        });
    }
}

/// A connected client: transport, router and the router's inbound stream.
struct Client {
    transport: Arc<WsTransport>,
    connection: Connection,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pump: JoinHandle<()>,
}

impl Client {
    async fn connect(config: &ClientConfig) -> Result<Self> {
        let (transport, inbound) = WsTransport::new(config.ws_settings());
        transport
            .connect()
            .await
            .context("starting websocket transport")?;
        let engine = CommandEngine::new(transport.clone(), config.command_settings());
        let (pump, inbound) = spawn_inbound_pump(engine.clone(), inbound);
        let connection = Connection::new(
            engine,
            config.router_settings(),
            config.timeline_limits(),
        );
        Ok(Self {
            transport,
            connection,
            inbound,
            pump,
        })
    }

    async fn shutdown(self) {
        self.transport.disconnect().await;
        self.pump.abort();
    }
}

async fn handle_tail(ctx: &RuntimeContext, cmd: TailCommand) -> Result<()> {
    let mut client = Client::connect(&ctx.config).await?;
    client
        .connection
        .enter_session(&cmd.session)
        .await
        .with_context(|| format!("subscribing to session {}", cmd.session))?;
    info!(session_id = %cmd.session, "following session");

    let mut status = client.connection.connection_status();
    let mut printer = TimelinePrinter::default();
    let mut was_connected = true;
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = sweep.tick() => {
                let (permissions, dialogs) = client.connection.sweep_expired(Utc::now());
                if permissions + dialogs > 0 {
                    debug!("expired {permissions} permission(s) and {dialogs} dialog(s)");
                }
            }
            message = client.inbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                client.connection.handle(message).await;
                client.connection.apply_fetch_results();
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!(%current, "connection status");
                match current {
                    ConnectionStatus::Connected if !was_connected => {
                        was_connected = true;
                        if let Err(e) = client.connection.resubscribe().await {
                            warn!(error = %e, "re-subscribe after reconnect failed");
                        }
                    }
                    ConnectionStatus::Connected => {}
                    ConnectionStatus::Disconnected => {
                        warn!("connection closed");
                        break;
                    }
                    _ => was_connected = false,
                }
            }
        }
        printer.print_changes(client.connection.timeline())?;
    }

    if let Err(e) = client.connection.disconnect_session(&cmd.session).await {
        debug!("unsubscribe on exit failed: {e}");
    }
    client.shutdown().await;
    Ok(())
}

/// Prints items whose content changed since the last render generation.
#[derive(Default)]
struct TimelinePrinter {
    generation: Option<u64>,
    printed: Vec<TimelineItem>,
}

impl TimelinePrinter {
    fn print_changes(&mut self, timeline: &TimelineReducer) -> Result<()> {
        if self.generation == Some(timeline.generation()) {
            return Ok(());
        }
        self.generation = Some(timeline.generation());

        let current: Vec<TimelineItem> = timeline.visible_items().cloned().collect();
        let mut stdout = io::stdout().lock();
        for (index, item) in current.iter().enumerate() {
            if self.printed.get(index) != Some(item) {
                let line = serde_json::to_string(item).context("serializing timeline item")?;
                writeln!(stdout, "{line}")?;
            }
        }
        stdout.flush()?;
        self.printed = current;
        Ok(())
    }
}

async fn handle_prompt(ctx: &RuntimeContext, cmd: PromptCommand) -> Result<()> {
    let kind = if cmd.steer {
        TurnKind::Steer
    } else if cmd.follow_up {
        TurnKind::FollowUp
    } else {
        TurnKind::Prompt
    };

    let mut client = Client::connect(&ctx.config).await?;
    client
        .connection
        .enter_session(&cmd.session)
        .await
        .with_context(|| format!("subscribing to session {}", cmd.session))?;

    let progress: ProgressFn = Arc::new(|stage: AckStage| {
        info!(stage = stage.as_str(), "turn progress");
    });
    let result = client
        .connection
        .send_turn(kind, &cmd.message, Vec::new(), Some(progress))
        .await;
    client.shutdown().await;

    match result {
        Ok(_) => {
            report(ctx, "delivered", None);
            Ok(())
        }
        Err(e) => {
            let label = outcome_label(&e);
            report(ctx, label, Some(&e.to_string()));
            Err(anyhow::Error::new(e).context(format!("message {label}")))
        }
    }
}

fn outcome_label(error: &CommandError) -> &'static str {
    match error {
        CommandError::Rejected { .. } => "rejected",
        CommandError::Timeout { .. } => "timed out",
        _ => "failed",
    }
}

fn report(ctx: &RuntimeContext, status: &str, error: Option<&str>) {
    if ctx.common.json {
        println!("{}", json!({ "status": status, "error": error }));
    } else {
        match error {
            Some(error) => println!("{status}: {error}"),
            None => println!("{status}"),
        }
    }
}

async fn handle_fork(ctx: &RuntimeContext, cmd: ForkCommand) -> Result<()> {
    let mut client = Client::connect(&ctx.config).await?;
    client
        .connection
        .enter_session(&cmd.session)
        .await
        .with_context(|| format!("subscribing to session {}", cmd.session))?;

    let result = client.connection.fork_from_entry(&cmd.entry_id).await;
    client.shutdown().await;

    let data = result.with_context(|| format!("forking from entry {}", cmd.entry_id))?;
    match data {
        Some(data) if ctx.common.json => println!("{data}"),
        Some(data) => println!(
            "{}",
            serde_json::to_string_pretty(&data).context("serializing fork result")?
        ),
        None => println!("forked"),
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_prompt_flags() {
        let cli = Cli::try_parse_from(["oppi", "prompt", "s1", "hello", "--steer"]).unwrap();
        match cli.command {
            Command::Prompt(cmd) => {
                assert!(cmd.steer);
                assert!(!cmd.follow_up);
                assert_eq!(cmd.message, "hello");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["oppi", "prompt", "s1", "x", "--steer", "--follow-up"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["oppi", "tail", "s1", "--json", "-vv"]).unwrap();
        assert!(cli.common.json);
        assert_eq!(cli.common.verbose, 2);
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_outcome_labels() {
        let rejected = CommandError::Rejected {
            command: "prompt".to_string(),
            reason: "busy".to_string(),
        };
        assert_eq!(outcome_label(&rejected), "rejected");
        assert_eq!(outcome_label(&CommandError::Dropped), "failed");
    }
}

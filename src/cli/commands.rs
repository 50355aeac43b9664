use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, unbounded};
use pcsc::State;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::{
    commands::{CommandExecutor, CommandRequest, CommandResult, CorrelationToken},
    config::MonitorConfig,
    dispatcher::{Delivery, EventDispatcher},
    error::MonitorError,
    events::{Channel, Event, StatusChangeEvent},
    notification::{GateTransition, NotificationGate},
    poller::StatusPoller,
    reader::{ContextScope, PcscBackend},
    session::ReaderSession,
    status::ReaderStatus,
    utils::format_hex_spaced,
};

/// How long the event loop waits before checking on the poller thread
const EVENT_LOOP_TICK: Duration = Duration::from_millis(200);

/// Status wait timeout used by `--once` when none is configured, so the stop flag gets checked
const ONCE_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pcsc-card-monitor")]
#[command(about = "Watch PCSC smart card readers and run tools against inserted cards")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,

        /// Context scope (user or system)
        #[arg(short, long, default_value = "user")]
        scope: ContextScope,
    },

    /// Watch readers and report card insertion and removal
    Monitor {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Status wait timeout in milliseconds (default: wait forever)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Context scope (user or system)
        #[arg(short, long)]
        scope: Option<ContextScope>,

        /// Command to run against every inserted card, split on whitespace,
        /// e.g. "pkcs15-tool --list-data-objects". Pass arguments containing
        /// spaces after `--` instead.
        #[arg(short, long, conflicts_with = "tool")]
        exec: Option<String>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Exit after the first card has been handled: its tool result when a
        /// tool is configured, otherwise its card event
        #[arg(long)]
        once: bool,

        /// Tool argv run against every inserted card, given after `--`
        #[arg(last = true)]
        tool: Vec<String>,
    },

    /// Run an external command and print its combined output
    Run {
        /// Correlation token reported with the result
        #[arg(long)]
        token: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::List { detailed, scope } => cmd_list(detailed, scope),
        Commands::Monitor {
            config,
            timeout_ms,
            scope,
            exec,
            json,
            once,
            tool,
        } => {
            let base = match config {
                Some(path) => MonitorConfig::load(&path)?,
                None => MonitorConfig::default(),
            };
            let overrides = MonitorOverrides {
                timeout_ms,
                scope,
                exec,
                tool,
                once,
            };
            cmd_monitor(overrides.apply(base), json, once)
        }
        Commands::Run { token, json, argv } => cmd_run(argv, token, json),
    }
}

/// Command line values that take precedence over the config file
#[derive(Debug, Default)]
struct MonitorOverrides {
    timeout_ms: Option<u64>,
    scope: Option<ContextScope>,
    exec: Option<String>,
    tool: Vec<String>,
    once: bool,
}

impl MonitorOverrides {
    fn apply(self, mut config: MonitorConfig) -> MonitorConfig {
        if let Some(timeout_ms) = self.timeout_ms {
            config.poll_timeout_ms = Some(timeout_ms);
        }
        if let Some(scope) = self.scope {
            config.scope = scope;
        }
        if let Some(exec) = self.exec {
            config.tool = exec.split_whitespace().map(String::from).collect();
        }
        if !self.tool.is_empty() {
            config.tool = self.tool;
        }
        if self.once && config.poll_timeout_ms.is_none() {
            config.poll_timeout_ms = Some(ONCE_POLL_TIMEOUT.as_millis() as u64);
        }
        config
    }
}

fn cmd_list(detailed: bool, scope: ContextScope) -> Result<()> {
    let mut session =
        ReaderSession::acquire(PcscBackend::new(), scope).context("Failed to initialize PCSC")?;

    let readers = session.list_readers().context("Failed to list readers")?;

    if readers.is_empty() {
        println!("No PCSC readers found.");
        return Ok(());
    }

    // A zero timeout wait from the unaware state reports the current state of every reader
    let current = vec![State::UNAWARE; readers.len()];
    let mut flags = vec![State::UNAWARE; readers.len()];
    session
        .wait_status(Some(Duration::ZERO), &readers, &current, &mut flags)
        .context("Failed to read reader status")?;

    println!("Available PCSC readers:");
    for (i, (name, &state)) in readers.iter().zip(&flags).enumerate() {
        let status = ReaderStatus::reduce(state);
        let atr = if status.implies_card() {
            session.status_detail(name).unwrap_or_else(|e| {
                log::warn!("{e}");
                None
            })
        } else {
            None
        };

        if detailed {
            println!("  [{i}] {name}");
            println!("      Status: {status}");
            if let Some(ref atr) = atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if let Some(ref atr) = atr {
            println!("  [{i}] {name} [CARD - ATR: {}]", format_hex_spaced(atr));
        } else {
            println!("  [{i}] {name}");
        }
    }

    session.release();
    Ok(())
}

/// Result of a tool run started for a card, tagged with its reader
type ToolOutcome = (String, std::result::Result<CommandResult, MonitorError>);

fn cmd_monitor(config: MonitorConfig, json: bool, once: bool) -> Result<()> {
    let dispatcher = Arc::new(EventDispatcher::new());
    let gate = NotificationGate::new();

    // The printing observer comes first so it sees card events before the tool claims them
    let (_, status_rx) = dispatcher.subscribe_deferred(Channel::ReaderStatus);
    let (_, card_rx) = dispatcher.subscribe_deferred(Channel::CardEvent);

    let (tool_tx, tool_rx) = unbounded::<ToolOutcome>();
    let runs_tool = !config.tool.is_empty();
    if runs_tool {
        let executor = CommandExecutor::new();
        let tool = config.tool.clone();
        dispatcher.subscribe(Channel::CardEvent, move |event| {
            let Event::CardEvent(card) = event else {
                return Delivery::Continue;
            };

            let reader = card.reader.clone();
            let request = CommandRequest::new(tool.clone(), CorrelationToken::new());
            let tx = tool_tx.clone();
            let done_reader = reader.clone();
            if let Err(e) = executor.execute(request, move |result| {
                let _ = tx.send((done_reader, Ok(result)));
            }) {
                let _ = tool_tx.send((reader, Err(e)));
            }
            Delivery::Claimed
        });
    }

    println!("Waiting for card...");

    loop {
        let poller = StatusPoller::new(
            PcscBackend::new(),
            Arc::clone(&dispatcher),
            config.poller_config(),
        );
        let handle = poller.spawn()?;

        let mut cards_seen = 0usize;
        let mut tool_results = 0usize;

        while !handle.is_finished() {
            select! {
                recv(status_rx) -> msg => {
                    if let Ok(Event::ReaderStatus(event)) = msg {
                        handle_status(&gate, &event, json)?;
                    }
                }
                recv(card_rx) -> msg => {
                    if let Ok(event @ Event::CardEvent(_)) = msg {
                        if json {
                            println!("{}", serde_json::to_string(&event)?);
                        }
                        cards_seen += 1;
                    }
                }
                recv(tool_rx) -> msg => {
                    if let Ok((reader, outcome)) = msg {
                        print_tool_outcome(&reader, &outcome, json)?;
                        gate.clear(&reader);
                        tool_results += 1;
                    }
                }
                default(EVENT_LOOP_TICK) => {}
            }

            let handled = if runs_tool { tool_results } else { cards_seen };
            if once && handled > 0 {
                handle.stop();
            }
        }

        // Transitions published just before the poller ended
        for event in status_rx.try_iter() {
            if let Event::ReaderStatus(event) = event {
                handle_status(&gate, &event, json)?;
            }
        }

        match handle.join() {
            Ok(_) => return Ok(()),
            Err(MonitorError::NoReadersFound) => {
                println!(
                    "No PCSC readers found. Rescanning in {}ms...",
                    config.rescan_interval_ms
                );
                thread::sleep(config.rescan_interval());
            }
            Err(e) => return Err(e).context("Reader monitoring failed"),
        }
    }
}

fn handle_status(gate: &NotificationGate, event: &StatusChangeEvent, json: bool) -> Result<()> {
    print_status(event, json)?;
    match gate.on_event(event) {
        GateTransition::Raised if !json => println!("Card Detected on {}", event.reader),
        GateTransition::Cleared if !json => {
            println!("Card notification cleared for {}", event.reader)
        }
        _ => {}
    }
    Ok(())
}

fn print_status(event: &StatusChangeEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&Event::ReaderStatus(event.clone()))?);
    } else {
        println!("[{}] {event}", event.observed_at.format("%H:%M:%S"));
    }
    Ok(())
}

fn print_tool_outcome(
    reader: &str,
    outcome: &std::result::Result<CommandResult, MonitorError>,
    json: bool,
) -> Result<()> {
    match outcome {
        Ok(result) if json => println!("{}", serde_json::to_string(result)?),
        Ok(result) => {
            println!(
                "Tool result for {reader} [{}] ({}, {}ms):",
                result.correlation_token,
                if result.succeeded { "OK" } else { "ERROR" },
                result.duration_ms
            );
            print!("{}", result.exit_output);
        }
        Err(e) => eprintln!("Tool not started for {reader}: {e}"),
    }
    Ok(())
}

fn cmd_run(argv: Vec<String>, token: Option<String>, json: bool) -> Result<()> {
    let token = token
        .map(CorrelationToken::from)
        .unwrap_or_default();
    let request = CommandRequest::new(argv, token);

    let (tx, rx) = unbounded();
    CommandExecutor::new()
        .execute(request, move |result| {
            let _ = tx.send(result);
        })
        .context("Failed to start command")?
        .wait();

    let result = rx
        .recv()
        .context("Command finished without reporting a result")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.exit_output);
        log::info!(
            "Command [{}] finished in {}ms",
            result.correlation_token,
            result.duration_ms
        );
    }

    if !result.succeeded {
        match result.exit_code {
            Some(code) => bail!("Command exited with status {code}"),
            None => bail!("Command failed"),
        }
    }

    Ok(())
}

//! zdbg command line front end.

mod output;
mod parse;
mod shell;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use output::print_event;
use parse::{parse_address, parse_hex, parse_hex_bytes, parse_watch};
use shell::{parse_line, ShellCommand, HELP};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use zdbg_core::{
    BreakpointRequest, DebugCommand, DebugEvent, RemoteConfig, SessionHandle, StepKind, WatchKind,
};

#[derive(Parser)]
#[command(name = "zdbg", author, version, about, long_about = None)]
struct Cli {
    /// Backend configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to use without a configuration file
    #[arg(short, long, value_enum, default_value_t = Backend::Simulator)]
    backend: Backend,

    /// Host of a network backend
    #[arg(long)]
    host: Option<String>,

    /// Port of a network backend
    #[arg(short, long)]
    port: Option<u16>,

    /// Binary loaded by the simulator
    #[arg(long)]
    program: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Zesarux,
    Mame,
    Dzrp,
    Simulator,
}

impl Backend {
    const fn name(self) -> &'static str {
        match self {
            Self::Zesarux => "zesarux",
            Self::Mame => "mame",
            Self::Dzrp => "dzrp",
            Self::Simulator => "simulator",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StepArg {
    Into,
    Over,
    Out,
}

impl From<StepArg> for StepKind {
    fn from(arg: StepArg) -> Self {
        match arg {
            StepArg::Into => Self::Into,
            StepArg::Over => Self::Over,
            StepArg::Out => Self::Out,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the registers
    Regs,
    /// Read memory
    Read {
        address: String, // Hex string
        #[arg(default_value = "10")]
        length: String, // Hex string
    },
    /// Write memory
    Write {
        address: String, // Hex string
        data: String,    // Hex string (e.g. "3E11")
    },
    /// Resume until the target stops
    Run {
        /// Breakpoint to arm first, ADDR or ADDR@BANK
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<String>,
        /// Write watchpoint to arm first, ADDR[:LEN]
        #[arg(short, long)]
        watch: Vec<String>,
        /// Pause the target after this many milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Step instructions
    Step {
        #[arg(value_enum, default_value_t = StepArg::Into)]
        kind: StepArg,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Interactive command shell
    Shell,
}

fn remote_config(cli: &Cli) -> Result<RemoteConfig> {
    let config = match &cli.config {
        Some(path) => RemoteConfig::from_file(path)?,
        None => RemoteConfig::for_backend(cli.backend.name())
            .with_context(|| format!("Unknown backend {}", cli.backend.name()))?,
    };
    let mut config = config.with_endpoint(cli.host.clone(), cli.port);
    if let Some(program) = &cli.program {
        let RemoteConfig::Simulator(settings) = &mut config else {
            bail!("--program is only supported by the simulator");
        };
        settings.program = Some(program.clone());
    }
    Ok(config)
}

/// Print events until one matches `want`. An error event aborts.
async fn wait_for(
    events: &mut broadcast::Receiver<DebugEvent>,
    json: bool,
    want: impl Fn(&DebugEvent) -> bool,
) -> Result<DebugEvent> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                log::warn!("Missed {count} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => bail!("Session closed"),
        };
        print_event(&event, json);
        match &event {
            DebugEvent::Error(message) => bail!("{message}"),
            DebugEvent::Disconnected => bail!("Target disconnected"),
            _ if want(&event) => return Ok(event),
            _ => {}
        }
    }
}

fn is_stop(event: &DebugEvent) -> bool {
    matches!(event, DebugEvent::Stopped(_))
}

fn is_registers(event: &DebugEvent) -> bool {
    matches!(event, DebugEvent::Registers(_))
}

async fn run_command(cli: &Cli, session: &SessionHandle) -> Result<()> {
    let mut events = session.subscribe();
    let json = cli.json;

    match &cli.command {
        Commands::Regs => {
            session.send(DebugCommand::ReadRegisters)?;
            wait_for(&mut events, json, is_registers).await?;
        }
        Commands::Read { address, length } => {
            session.send(DebugCommand::ReadMemory(parse_hex(address)?, parse_hex(length)?))?;
            wait_for(&mut events, json, |e| matches!(e, DebugEvent::MemoryData(..))).await?;
        }
        Commands::Write { address, data } => {
            let address = parse_hex(address)?;
            let bytes = parse_hex_bytes(data)?;
            let length = u16::try_from(bytes.len()).context("Too much data")?;
            session.send(DebugCommand::WriteMemory(address, bytes))?;
            session.send(DebugCommand::ReadMemory(address, length))?;
            wait_for(&mut events, json, |e| matches!(e, DebugEvent::MemoryData(..))).await?;
        }
        Commands::Run { breakpoints, watch, timeout } => {
            for address in breakpoints {
                session.send(DebugCommand::SetBreakpoint(BreakpointRequest::at(parse_address(address)?)))?;
            }
            for text in watch {
                session.send(DebugCommand::SetWatchpoint(parse_watch(text, WatchKind::Write)?))?;
            }
            session.send(DebugCommand::Resume)?;
            {
                let stopped = wait_for(&mut events, json, is_stop);
                tokio::pin!(stopped);
                match timeout {
                    Some(ms) => {
                        tokio::select! {
                            result = &mut stopped => { result?; }
                            () = tokio::time::sleep(Duration::from_millis(*ms)) => {
                                log::info!("Timeout reached, pausing");
                                session.send(DebugCommand::Pause)?;
                                stopped.await?;
                            }
                        }
                    }
                    None => {
                        stopped.await?;
                    }
                }
            }
            session.send(DebugCommand::ReadRegisters)?;
            wait_for(&mut events, json, is_registers).await?;
        }
        Commands::Step { kind, count } => {
            for _ in 0..*count {
                session.send(DebugCommand::Step((*kind).into()))?;
                wait_for(&mut events, json, is_stop).await?;
            }
            session.send(DebugCommand::ReadRegisters)?;
            wait_for(&mut events, json, is_registers).await?;
        }
        Commands::Shell => run_shell(session, json).await?,
    }
    Ok(())
}

async fn run_shell(session: &SessionHandle, json: bool) -> Result<()> {
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_event(&event, json);
                    if event == DebugEvent::Disconnected {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_line(&line) {
            Ok(Some(ShellCommand::Debug(cmd))) => session.send(cmd)?,
            Ok(Some(ShellCommand::Help)) => println!("{HELP}"),
            Ok(Some(ShellCommand::Quit)) => break,
            Ok(None) => {}
            Err(e) => eprintln!("{e}"),
        }
        if printer.is_finished() {
            break;
        }
    }
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = remote_config(&cli)?;
    log::info!("Starting zdbg with {config:?}");
    let session = SessionHandle::connect(&config).await?;

    let result = run_command(&cli, &session).await;
    session.shutdown().await?;
    result
}

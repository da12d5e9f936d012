use std::error::Error;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use scpichannel::{CancelHandle, Channel, ChannelConfig, Target};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_IP: &str = "192.168.131.182";
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "scpi_client", about = "Send SCPI commands to an instrument over TCP or a VISA resource")]
struct Cli {
    /// Instrument IP address or host name
    #[arg(long, default_value = DEFAULT_IP)]
    ip: String,

    /// TCP port of the instrument's SCPI socket
    #[arg(long, default_value_t = scpichannel::channel::DEFAULT_PORT)]
    port: u16,

    /// VISA resource string, e.g. TCPIP0::192.168.123.1::inst0::INSTR (replaces --ip/--port)
    #[arg(long, conflicts_with_all = ["ip", "port"])]
    resource: Option<String>,

    /// Connection timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Query read timeout in milliseconds (defaults to the connection timeout)
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Largest response accepted per query, in bytes
    #[arg(long, default_value_t = scpichannel::channel::DEFAULT_MAX_RESPONSE_LEN)]
    max_response: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// AC voltage, frequency and output-on demonstration sequence
    Configure {
        /// Delay before the first command, in milliseconds
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
    /// Interactive prompt; commands ending in '?' are queries
    Repl,
    /// Send one command without reading a response
    Send { command: String },
    /// Send one query and print the response
    Query { command: String },
}

impl Cli {
    fn target(&self) -> Target {
        match &self.resource {
            Some(resource) => Target::Resource(resource.clone()),
            None => Target::Tcp {
                host: self.ip.clone(),
                port: self.port,
            },
        }
    }

    fn channel_config(&self) -> ChannelConfig {
        let mut config = ChannelConfig::default()
            .with_connect_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_response_len(self.max_response);
        if let Some(ms) = self.read_timeout_ms {
            config = config.with_read_timeout(Duration::from_millis(ms));
        }
        config
    }
}

/// Input reaching the command loop: a typed line, end of input, or Ctrl-C.
enum Event {
    Line(String),
    Eof,
    Interrupted,
}

/// Shared with the Ctrl-C handler.
#[derive(Default)]
struct Interrupt {
    requested: AtomicBool,
    in_flight: AtomicBool,
    cancel: Mutex<Option<CancelHandle>>,
}

impl Interrupt {
    /// Records the request and aborts instrument I/O that is blocked right now.
    fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) {
            if let Ok(cancel) = self.cancel.lock() {
                if let Some(handle) = cancel.as_ref() {
                    handle.cancel();
                }
            }
        }
    }

    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn arm(&self, handle: Option<CancelHandle>) {
        if let Ok(mut cancel) = self.cancel.lock() {
            *cancel = handle;
        }
    }

    /// Runs one channel operation with cancellation armed.
    fn guarded<R>(&self, op: impl FnOnce() -> R) -> R {
        self.in_flight.store(true, Ordering::SeqCst);
        let result = op();
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

fn install_interrupt_handler(interrupt: Arc<Interrupt>, events: Sender<Event>) {
    let result = ctrlc::set_handler(move || {
        interrupt.trigger();
        let _ = events.send(Event::Interrupted);
    });
    if let Err(e) = result {
        warn!(error = %e, "could not install the Ctrl-C handler");
    }
}

/// Reads stdin on its own thread so a blocked prompt can still see Ctrl-C.
fn spawn_stdin_reader(events: Sender<Event>) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let event = match line {
                Ok(line) => Event::Line(line),
                Err(e) => {
                    warn!(error = %e, "could not read from stdin");
                    break;
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
        let _ = events.send(Event::Eof);
    });
}

fn basic_configuration(channel: &mut Channel, settle: Duration, events: &Receiver<Event>, interrupt: &Interrupt) {
    info!("starting basic configuration");
    if let Ok(Event::Interrupted) = events.recv_timeout(settle) {
        return;
    }

    for command in ["VOLT:MODE AC", "VOLT:AC 100", "FREQ 60", "OUTP 1;"] {
        if interrupt.requested() {
            return;
        }
        if let Err(e) = interrupt.guarded(|| channel.send(command)) {
            error!(command, error = %e, "send failed");
        }
    }

    for query in [":*OPC?", "MEAS:VOLT?", "MEAS:FREQ?"] {
        if interrupt.requested() {
            return;
        }
        match interrupt.guarded(|| channel.query(query)) {
            Ok(response) => println!("{query} -> {response}"),
            Err(e) => error!(command = query, error = %e, "query failed"),
        }
    }

    info!("basic configuration completed");
}

/// Shows the instrument identification, then hands over to the prompt.
fn repl(channel: &mut Channel, events: &Receiver<Event>, interrupt: &Interrupt) -> Result<(), Box<dyn Error>> {
    match interrupt.guarded(|| channel.query("*IDN?")) {
        Ok(idn) => println!("Connected to: {idn}"),
        Err(e) => warn!(error = %e, "identification query failed"),
    }
    interactive(channel, events, interrupt)
}

fn interactive(channel: &mut Channel, events: &Receiver<Event>, interrupt: &Interrupt) -> Result<(), Box<dyn Error>> {
    println!("Enter SCPI commands directly. Type 'exit' to quit.");
    println!("Use '?' at the end of the command to make a query.\n");

    let mut stdout = std::io::stdout();
    while !interrupt.requested() {
        write!(stdout, "SCPI> ")?;
        stdout.flush()?;

        let line = match events.recv() {
            Ok(Event::Line(line)) => line,
            Ok(Event::Eof) | Err(_) => {
                println!();
                break;
            }
            Ok(Event::Interrupted) => break,
        };

        let command = line.trim();
        if command.eq_ignore_ascii_case("exit") || command.eq_ignore_ascii_case("quit") {
            break;
        }
        if command.is_empty() {
            continue;
        }

        match interrupt.guarded(|| channel.execute(command)) {
            Ok(Some(response)) => println!("{response}"),
            Ok(None) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

fn run(
    cli: &Cli,
    channel: &mut Channel,
    sender: Sender<Event>,
    events: &Receiver<Event>,
    interrupt: &Interrupt,
) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Command::Configure { settle_ms } => {
            basic_configuration(channel, Duration::from_millis(*settle_ms), events, interrupt);
            Ok(())
        }
        Command::Repl => {
            spawn_stdin_reader(sender);
            repl(channel, events, interrupt)
        }
        Command::Send { command } => Ok(interrupt.guarded(|| channel.send(command))?),
        Command::Query { command } => {
            println!("{}", interrupt.guarded(|| channel.query(command))?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let interrupt = Arc::new(Interrupt::default());
    let (sender, events) = mpsc::channel();
    install_interrupt_handler(Arc::clone(&interrupt), sender.clone());

    let target = cli.target();
    let mut channel = Channel::for_target(&target, cli.channel_config());

    if let Err(e) = channel.try_connect() {
        eprintln!("Could not establish connection to {target}: {e}");
        eprintln!("  - {}", e.remediation());
        return ExitCode::FAILURE;
    }
    interrupt.arm(channel.cancel_handle());

    let result = if interrupt.requested() {
        Ok(())
    } else {
        run(&cli, &mut channel, sender, &events, &interrupt)
    };
    interrupt.arm(None);
    channel.disconnect();

    if interrupt.requested() {
        info!("interrupted by user");
        eprintln!("interrupted");
        return ExitCode::from(EXIT_INTERRUPTED);
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            warn!(error = %e, "finished with an error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

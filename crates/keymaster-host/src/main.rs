//! KeyMaster host - talk to the companion through the serial bridge
//!
//! Responses go to stdout, logs to stderr.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Level};
use tracing_subscriber::FmtSubscriber;

use keymaster_host::{
    detect_port, list_ports, Activity, CommandClient, ComputerInfo, Correlator, HostConfig,
    HostTransport, Note, Search, Session, SessionEnd, SystemPorts,
};
use keymaster_protocol::{Command, Response};

#[derive(Parser)]
#[command(name = "keymaster-host")]
#[command(about = "Send commands to the companion through the KeyMaster bridge")]
struct Args {
    /// Serial port (default: KEYMASTER_PORT or auto-detect)
    #[arg(long, short)]
    port: Option<String>,

    /// Baud rate (default: KEYMASTER_BAUD or 115200)
    #[arg(long, short)]
    baud: Option<u32>,

    /// Response timeout, e.g. "5s"
    #[arg(long, short, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Settle window after the first response line, e.g. "400ms"
    #[arg(long, value_parser = humantime::parse_duration)]
    settle: Option<Duration>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Round-trip check through the bridge
    Ping,
    /// Send a raw line and print whatever comes back
    Send {
        /// Line to send
        message: String,
    },
    /// Send `CMD:<name>[:<json>]`
    Cmd {
        /// Command name
        name: String,
        /// JSON payload
        json: Option<String>,
    },
    /// Companion status
    Status,
    /// Store a note
    Note {
        /// Note text
        content: String,
        /// Comma-separated tags
        #[arg(long, default_value = "")]
        tags: String,
        /// Project tag
        #[arg(long, default_value = "")]
        project: String,
        /// Note type: note, decision, bug, reminder, idea, todo, context
        #[arg(long = "type", default_value = "note")]
        kind: String,
    },
    /// Log what you are working on
    Activity {
        /// Program name
        program: String,
        /// Description
        #[arg(long, default_value = "")]
        details: String,
        /// File being worked on
        #[arg(long, default_value = "")]
        file: String,
        /// Project tag
        #[arg(long, default_value = "")]
        project: String,
    },
    /// Log a search query
    Search {
        /// Query text
        query: String,
        /// Source (google, github, ...)
        #[arg(long, default_value = "web")]
        source: String,
        /// Result URL
        #[arg(long, default_value = "")]
        url: String,
        /// Project tag
        #[arg(long, default_value = "")]
        project: String,
    },
    /// Start a session; prints the session id
    SessionStart {
        /// Assistant platform
        #[arg(long, default_value = "claude")]
        platform: String,
    },
    /// End a session with a summary
    SessionEnd {
        /// Id from session-start
        session_id: String,
        /// What was accomplished
        summary: String,
        /// Comma-separated project tags
        #[arg(long, default_value = "")]
        projects: String,
    },
    /// Register this computer with the companion
    Register,
    /// Session context from the companion
    Context,
    /// Query a companion table
    Query {
        /// Table name
        table: String,
        /// JSON filters
        #[arg(long)]
        filters: Option<String>,
        /// Maximum rows
        #[arg(long, default_value_t = 10)]
        limit: u32,
        /// Ordering clause
        #[arg(long, default_value = "created_at DESC")]
        order_by: String,
    },
    /// Print lines received since the last request
    Read {
        /// How long to listen first, e.g. "1s"
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
        wait: Duration,
    },
    /// List serial ports
    Ports,
    /// Available ports and connection status
    Info,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = HostConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(baud) = args.baud {
        config.baud = baud;
    }
    if let Some(timeout) = args.timeout {
        config.response_timeout = timeout;
    }
    if let Some(settle) = args.settle {
        config.settle = settle;
    }
    config.validate()?;
    debug!(?config, "Configuration");

    if let Cmd::Ports = args.command {
        print_ports();
        return Ok(());
    }

    if let Cmd::Info = args.command {
        print_ports();
        println!();
        let transport = HostTransport::system(config);
        if let Err(e) = transport.connect(None, None) {
            warn!(error = %e, "Could not connect");
        }
        println!("{}", transport.connection_info());
        if !transport.is_connected() {
            if let Some(port) = detect_port(&SystemPorts) {
                println!("Auto-detected bridge: {}", port);
            }
        }
        return Ok(());
    }

    let transport = Arc::new(HostTransport::system(config));
    transport.connect(None, None)?;
    let client = CommandClient::new(Correlator::new(transport));

    match args.command {
        Cmd::Ping => print_lines(&client.ping()?),
        Cmd::Send { message } => print_lines(&client.send_raw(&message, None)?),
        Cmd::Cmd { name, json } => {
            let mut command = Command::new(name)?;
            if let Some(json) = json {
                let payload = serde_json::from_str(&json)
                    .unwrap_or(serde_json::Value::String(json));
                command = command.with_payload(payload);
            }
            print_response(client.request(&command, None)?)
        }
        Cmd::Status => print_response(client.status()?),
        Cmd::Note {
            content,
            tags,
            project,
            kind,
        } => {
            let note = Note::new(content).tags(tags).project(project).kind(kind);
            print_response(client.note(&note)?)
        }
        Cmd::Activity {
            program,
            details,
            file,
            project,
        } => {
            let activity = Activity::new(program)
                .details(details)
                .file_path(file)
                .project(project);
            print_response(client.activity(&activity)?)
        }
        Cmd::Search {
            query,
            source,
            url,
            project,
        } => {
            let search = Search::new(query).source(source).url(url).project(project);
            print_response(client.search(&search)?)
        }
        Cmd::SessionStart { platform } => {
            print_response(client.session_start(&Session::new(platform))?)
        }
        Cmd::SessionEnd {
            session_id,
            summary,
            projects,
        } => {
            let end = SessionEnd::new(session_id, summary).projects(projects);
            print_response(client.session_end(&end)?)
        }
        Cmd::Register => print_response(client.register_computer(&ComputerInfo::detect())?),
        Cmd::Context => print_response(client.get_context()?),
        Cmd::Query {
            table,
            filters,
            limit,
            order_by,
        } => {
            let filters = match filters {
                Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("--filters must be valid JSON (e.g. '{{\"project\":\"cortex\"}}'): {}", e)
                })?),
                None => None,
            };
            print_response(client.query(&table, filters, limit, &order_by)?)
        }
        Cmd::Read { wait } => {
            std::thread::sleep(wait);
            let lines = client.read_pending();
            if lines.is_empty() {
                println!("No buffered responses");
            }
            for line in lines {
                println!("{}", line);
            }
        }
        Cmd::Ports | Cmd::Info => {}
    }

    Ok(())
}

fn print_ports() {
    let ports = list_ports(&SystemPorts);
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let marker = if port.is_likely_bridge() { "*" } else { " " };
        println!("{} {}", marker, port);
    }
}

fn print_lines(lines: &[String]) {
    if lines.is_empty() {
        println!("No response (timeout)");
    } else {
        println!("Response: {}", lines.join(" | "));
    }
}

fn print_response(response: Option<Response>) {
    match response {
        Some(response) => println!("{}", response),
        None => println!("No response (timeout)"),
    }
}

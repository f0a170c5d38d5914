//! Ad-hoc command-line access to a Lattice cluster.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::debug;

use lattice_client::{Client, ClientConfig, Status};

#[derive(Parser, Debug)]
#[command(
    name = "lattice",
    version,
    about = "Lattice key-value store client",
    arg_required_else_help = true
)]
struct Cli {
    /// Coordinator endpoint (overrides the config file).
    #[arg(long, global = true, value_name = "ADDR")]
    coordinator: Option<SocketAddr>,

    /// Config file (JSON).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the values stored under a key.
    Get { space: String, key: String },
    /// Store a full row of values under a key.
    Put {
        space: String,
        key: String,
        values: Vec<String>,
    },
    /// Delete the row stored under a key.
    Del { space: String, key: String },
    /// Overwrite named attributes of a row (name=value pairs).
    Update {
        space: String,
        key: String,
        assignments: Vec<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ClientConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("lattice: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => ClientConfig::default(),
    };
    if let Some(addr) = cli.coordinator {
        config.coordinator = addr;
    }
    debug!(coordinator = %config.coordinator, "using coordinator");

    let client = Client::from_config(&config);
    if let Err(err) = client.connect() {
        eprintln!("lattice: {err}");
        return ExitCode::FAILURE;
    }

    let outcome: Rc<RefCell<Option<(Status, Vec<Bytes>)>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);

    match cli.command {
        Command::Get { space, key } => {
            client.get(&space, key, move |status, values| {
                *sink.borrow_mut() = Some((status, values));
            });
        }
        Command::Put { space, key, values } => {
            let values = values.into_iter().map(Bytes::from).collect();
            client.put(&space, key, values, move |status| {
                *sink.borrow_mut() = Some((status, Vec::new()));
            });
        }
        Command::Del { space, key } => {
            client.del(&space, key, move |status| {
                *sink.borrow_mut() = Some((status, Vec::new()));
            });
        }
        Command::Update {
            space,
            key,
            assignments,
        } => {
            let mut values = BTreeMap::new();
            for assignment in &assignments {
                let Some((name, value)) = assignment.split_once('=') else {
                    eprintln!("lattice: expected name=value, got {assignment:?}");
                    return ExitCode::FAILURE;
                };
                values.insert(name.to_string(), Bytes::from(value.to_string()));
            }
            client.update(&space, key, values, move |status| {
                *sink.borrow_mut() = Some((status, Vec::new()));
            });
        }
    }

    if let Err(err) = client.flush() {
        eprintln!("lattice: {err}");
        return ExitCode::FAILURE;
    }

    match outcome.borrow_mut().take() {
        Some((Status::Success, values)) => {
            for value in values {
                println!("{}", String::from_utf8_lossy(&value));
            }
            ExitCode::SUCCESS
        }
        Some((status, _)) => {
            eprintln!("lattice: {status}");
            ExitCode::FAILURE
        }
        None => {
            eprintln!("lattice: operation never completed");
            ExitCode::FAILURE
        }
    }
}

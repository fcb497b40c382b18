//! FlatKV - maintenance tool
//!
//! Runs one operation against a record file through an arbiter and prints
//! the result. Useful for inspecting or repairing the files an application
//! keeps with FlatKV.

use anyhow::{bail, Context};
use flatkv::arbiter::{Arbiter, ArbiterConfig};
use flatkv::codec::{decode, Record, RecordLayout};
use flatkv::storage::StoreConfig;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The operation to run
#[derive(Debug)]
enum Command {
    Dump,
    Read(String),
    Contains(String),
    Delete(String),
    Take(String),
    Append(Vec<String>),
}

/// Tool configuration
#[derive(Debug)]
struct Config {
    /// Record file to operate on
    file: PathBuf,
    /// Index of the key field
    key_index: usize,
    /// Whether line 0 is a header
    header: bool,
    command: Command,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();

        let mut file = None;
        let mut key_index = 0;
        let mut header = false;
        let mut rest = Vec::new();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--file" | "-f" => {
                    let Some(value) = args.get(i + 1) else {
                        bail!("--file requires a value");
                    };
                    file = Some(PathBuf::from(value));
                    i += 2;
                }
                "--key-index" | "-k" => {
                    let Some(value) = args.get(i + 1) else {
                        bail!("--key-index requires a value");
                    };
                    key_index = value
                        .parse()
                        .with_context(|| format!("invalid key index: {value}"))?;
                    i += 2;
                }
                "--header" => {
                    header = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flatkv version {}", flatkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    rest.extend_from_slice(&args[i..]);
                    break;
                }
            }
        }

        let Some(file) = file else {
            bail!("--file is required (see --help)");
        };

        let mut rest = rest.into_iter();
        let command = match (rest.next().as_deref(), rest.next()) {
            (Some("dump"), None) => Command::Dump,
            (Some("read"), Some(key)) => Command::Read(key),
            (Some("contains"), Some(key)) => Command::Contains(key),
            (Some("delete"), Some(key)) => Command::Delete(key),
            (Some("take"), Some(key)) => Command::Take(key),
            (Some("append"), Some(first)) => {
                Command::Append(std::iter::once(first).chain(rest.by_ref()).collect())
            }
            (Some(other), _) => bail!("unknown or incomplete command: {other}"),
            (None, _) => bail!("no command given (see --help)"),
        };
        if rest.next().is_some() {
            bail!("too many arguments");
        }

        Ok(Self {
            file,
            key_index,
            header,
            command,
        })
    }

    /// Builds the store configuration, taking header labels from line 0 of the file.
    fn store_config(&self) -> anyhow::Result<StoreConfig> {
        let config = StoreConfig::new(&self.file).with_layout(RecordLayout::keyed(self.key_index));
        if !self.header {
            return Ok(config);
        }

        let contents = fs::read_to_string(&self.file)
            .with_context(|| format!("--header needs an existing file: {}", self.file.display()))?;
        let Some(first) = contents.lines().next() else {
            bail!("--header given but {} is empty", self.file.display());
        };
        let labels = decode(first, None).context("unreadable header line")?;
        Ok(config.with_header(labels))
    }
}

fn print_help() {
    println!(
        r#"
FlatKV - keyed record files maintenance tool

USAGE:
    flatkv --file <PATH> [OPTIONS] <COMMAND>

OPTIONS:
    -f, --file <PATH>        Record file to operate on
    -k, --key-index <N>      Index of the key field (default: 0)
        --header             Line 0 is a header (shown by dump, never matched)
    -v, --version            Print version information
        --help               Print this help message

COMMANDS:
    dump                     Print every record
    read <KEY>               Print the record with KEY
    contains <KEY>           Print whether KEY is present
    delete <KEY>             Delete KEY, print how many records were removed
    take <KEY>               Delete KEY and print the removed record
    append <FIELD>...        Append a record

EXAMPLES:
    flatkv -f ids.txt dump
    flatkv -f ids.txt --header read 123456789
    flatkv -f sessions.txt -k 1 take abc123

LOGGING:
    Set RUST_LOG (e.g. RUST_LOG=flatkv=debug) for diagnostics on stderr.
"#
    );
}

fn print_record(record: &Record) {
    println!("{record}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::WARN.as_str())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::from_args()?;
    debug!(?config, "Parsed arguments");

    let arbiter = Arbiter::open(config.store_config()?, ArbiterConfig::default())
        .with_context(|| format!("failed to open {}", config.file.display()))?;

    match config.command {
        Command::Dump => {
            for record in arbiter.dump(config.header).await? {
                print_record(&record);
            }
        }
        Command::Read(key) => match arbiter.read(key).await? {
            Some(record) => print_record(&record),
            None => println!("(not found)"),
        },
        Command::Contains(key) => {
            println!("{}", arbiter.scan(key).await?);
        }
        Command::Delete(key) => {
            println!("{}", arbiter.delete(key).await?);
        }
        Command::Take(key) => match arbiter.read_and_delete(key).await? {
            Some(record) => print_record(&record),
            None => println!("(not found)"),
        },
        Command::Append(fields) => {
            arbiter.append(Record::new(fields)).await?;
        }
    }

    Ok(())
}

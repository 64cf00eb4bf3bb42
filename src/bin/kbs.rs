//! A thin collaborator CLI over the storage core's public operations
//! surface: the idiomatic-Rust counterpart to `tools/kbs.py`'s
//! `get`/`put`/`ls` dispatch. Not part of the library's tested contract.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kbstorage::{Config, KbStore};

#[derive(Parser)]
#[command(name = "kbs", about = "Inspect and populate a kbstorage root")]
struct Cli {
    /// Root directory the storage lives in.
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a blob's contents to stdout.
    Get { key: String },
    /// Store stdin (or a file) under a key.
    Put {
        key: String,
        /// Reads from this file instead of stdin.
        file: Option<PathBuf>,
    },
    /// List every key and its blob size.
    Ls,
}

fn main() -> anyhow::Result<()> {
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
    .ok();

    let cli = Cli::parse();
    let config = Config::new(cli.root);
    let store = KbStore::open(&config)?;

    match cli.command {
        Command::Get { key } => {
            let blob = store.get(key.as_bytes())?;
            io::stdout().write_all(&blob)?;
        }
        Command::Put { key, file } => {
            let mut blob = Vec::new();
            match file {
                Some(path) => {
                    std::fs::File::open(path)?.read_to_end(&mut blob)?;
                }
                None => {
                    io::stdin().read_to_end(&mut blob)?;
                }
            }
            store.put(Some(key.into_bytes()), &blob)?;
        }
        Command::Ls => {
            let mut keys = store.keys();
            keys.sort();
            for key in keys {
                let meta = store.meta(&key)?;
                let key = String::from_utf8_lossy(&key);
                println!("{key:<40} {}", meta.size);
            }
        }
    }

    Ok(())
}

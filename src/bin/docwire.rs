use clap::Parser;
use std::{
    error::Error,
    io::{self, Write},
};

use docwire::{
    Command, ConnectionManager, ReadMode, ReadPreference, connection::read_preference::parse_tagset,
    execute, prompt,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Connection string, e.g. mongodb://localhost:27017/?replicaSet=rs0
    uri: String,

    /// Read preference mode for shell reads; defaults to the connection string's
    #[arg(long)]
    read_preference: Option<ReadMode>,

    /// Tagset in k:v,k:v form, tried in the order given
    #[arg(long)]
    tags: Vec<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; RUST_LOG controls verbosity
    env_logger::init();

    let cli = Cli::parse();
    let mut manager = ConnectionManager::new(&cli.uri)?;

    let default = manager.options().read_preference.clone();
    let read_preference = if cli.read_preference.is_none() && cli.tags.is_empty() {
        default
    } else {
        let tagsets = cli
            .tags
            .iter()
            .map(|t| parse_tagset(t))
            .collect::<Result<Vec<_>, _>>()?;
        ReadPreference::new(cli.read_preference.unwrap_or(default.mode()), tagsets)?
    };

    let mut stdout = io::stdout().lock();
    loop {
        let cmd = match prompt(io::stdin().lock(), &mut stdout) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        if let Err(e) = execute(&mut manager, &read_preference, &cmd, &mut stdout) {
            eprintln!("error: {e}");
        }
        stdout.flush()?;

        if cmd == Command::Exit {
            break;
        }
    }

    Ok(())
}

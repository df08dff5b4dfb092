//! Interactive shell utilities.
//!
//! [`prompt`] reads one command from the user; [`execute`] runs it against a
//! [`ConnectionManager`] and prints the outcome.
use std::io::{BufRead, Write};

use crate::{
    Command, CommandError,
    bson::Document,
    connection::{ConnectionManager, ReadPreference},
    cursor::Cursor,
    error::Result,
};

/// Prompts for a command. A blank line yields `None`; end of input yields [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> std::result::Result<Option<Command>, CommandError>
where
    R: BufRead,
    W: Write,
{
    let input_error = |e: std::io::Error| CommandError::Input(e.to_string());

    write!(&mut writer, "docwire> ").map_err(input_error)?;
    writer.flush().map_err(input_error)?;

    let mut s = String::default();
    if reader.read_line(&mut s).map_err(input_error)? == 0 {
        return Ok(Some(Command::Exit));
    }
    if s.trim().is_empty() {
        return Ok(None);
    }
    Command::try_from(s.as_str()).map(Some)
}

/// Runs `command`, writing its output to `writer`. Reads are routed by `read_preference`.
pub fn execute<W: Write>(
    manager: &mut ConnectionManager,
    read_preference: &ReadPreference,
    command: &Command,
    mut writer: W,
) -> Result<()> {
    match command {
        Command::Exit => manager.close(),
        Command::Hosts => {
            for host in manager.hosts() {
                let ping = host
                    .ping
                    .map(|p| format!("{:.3}ms", p.as_secs_f64() * 1000.0))
                    .unwrap_or_else(|| "-".to_string());
                let marker = if manager.primary_hash() == Some(host.hash.as_str()) {
                    "*"
                } else {
                    " "
                };
                writeln!(
                    writer,
                    "{marker} {:<24} {:<10} healthy={} ping={ping}",
                    host.hash, host.state, host.healthy
                )?;
            }
        }
        Command::Ping => {
            let hash = manager.read_target(read_preference)?;
            let rtt = manager.ping(&hash)?;
            writeln!(writer, "{hash}: {:.3}ms", rtt.as_secs_f64() * 1000.0)?;
        }
        Command::Find { namespace, limit } => {
            let cursor = Cursor::new(manager, namespace, Document::new())
                .read_preference(read_preference.clone())
                .limit(*limit);
            let mut count = 0;
            for document in cursor {
                writeln!(writer, "{}", document?)?;
                count += 1;
            }
            writeln!(writer, "({count} documents)")?;
        }
        Command::Run { database, command } => {
            let mut document = Document::new();
            document.insert(command.as_str(), 1);
            let reply = manager
                .read_protocol(read_preference)?
                .run_command(database, &document)?;
            writeln!(writer, "{reply}")?;
        }
    }
    Ok(())
}

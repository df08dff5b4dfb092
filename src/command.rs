//! Shell commands.
//!
//! This module defines the [`Command`] enum the `docwire` shell accepts, and how a line of user
//! input is parsed into one.
//!
//! # Overview
//!
//! - `.exit`: close every connection and leave the shell.
//! - `.hosts`: list known hosts with their state and last measured latency.
//! - `ping`: measure the round trip to the host the shell's read preference resolves to.
//! - `find <db.collection> [limit]`: print matching documents.
//! - `run <db> <command>`: run a command such as `isMaster` and print the reply.
//!
//! # Example
//! ```rust
//! use docwire::Command;
//!
//! let cmd = Command::try_from("find app.users 5").unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Find { namespace: "app.users".to_string(), limit: 5 }
//! );
//! ```
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("failed to read input: {0}")]
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Hosts,
    Ping,
    /// Query a collection; a zero limit returns everything.
    Find { namespace: String, limit: i32 },
    Run { database: String, command: String },
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let parts = s.split_whitespace().collect::<Vec<&str>>();
        let invalid = |command: &str, reason: &str| CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: reason.to_string(),
        };

        match parts.as_slice() {
            [".exit"] => Ok(Command::Exit),
            [".hosts"] => Ok(Command::Hosts),
            ["ping"] => Ok(Command::Ping),
            ["find", namespace, rest @ ..] => {
                if !namespace.contains('.') {
                    return Err(invalid("find", "namespace must be <db>.<collection>"));
                }
                let limit = match rest {
                    [] => 0,
                    [limit] => limit
                        .parse::<i32>()
                        .ok()
                        .filter(|l| *l >= 0)
                        .ok_or_else(|| invalid("find", "limit must be a non-negative integer"))?,
                    _ => return Err(invalid("find", "expected: find <db.collection> [limit]")),
                };
                Ok(Command::Find {
                    namespace: namespace.to_string(),
                    limit,
                })
            }
            ["find"] => Err(invalid("find", "expected: find <db.collection> [limit]")),
            ["run", database, command] => Ok(Command::Run {
                database: database.to_string(),
                command: command.to_string(),
            }),
            ["run", ..] => Err(invalid("run", "expected: run <db> <command>")),
            _ => Err(CommandError::UnrecognizedCommand(s.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_string() {
        let inputs = vec![
            (".exit", Command::Exit),
            (" .hosts ", Command::Hosts),
            ("ping", Command::Ping),
            (
                "find app.users",
                Command::Find {
                    namespace: "app.users".to_string(),
                    limit: 0,
                },
            ),
            (
                "find app.users 3",
                Command::Find {
                    namespace: "app.users".to_string(),
                    limit: 3,
                },
            ),
            (
                "run admin isMaster",
                Command::Run {
                    database: "admin".to_string(),
                    command: "isMaster".to_string(),
                },
            ),
        ];

        for (cmd, expected) in inputs {
            assert_eq!(Command::try_from(cmd).unwrap(), expected);
        }
    }

    #[test]
    fn invalid_arguments() {
        for cmd in ["find users", "find app.users -1", "find", "run admin", "find a.b 1 2"] {
            assert!(
                matches!(
                    Command::try_from(cmd),
                    Err(CommandError::InvalidCommandArguments { .. })
                ),
                "{cmd}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "UnrecognizedCommand(\".structure\")")]
    fn unrecognized_command() {
        Command::try_from(".structure").unwrap();
    }
}

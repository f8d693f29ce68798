//! Stdin command parsing.

use std::path::PathBuf;
use std::str::FromStr;

use handoff_core::TransferId;

pub const USAGE: &str = "commands: send <path> | accept <id> | reject <id> | cancel <id> | status | history | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(PathBuf),
    Accept(TransferId),
    Reject(TransferId),
    Cancel(TransferId),
    Status,
    History,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
    #[error("not a transfer id: {0:?}")]
    BadId(String),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((v, r)) => (v, r.trim()),
            None => (line, ""),
        };
        match verb.to_ascii_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            // Paths may contain spaces; take the rest of the line verbatim.
            "send" => {
                if rest.is_empty() {
                    Err(CommandError::MissingArgument("send"))
                } else {
                    Ok(Command::Send(PathBuf::from(rest)))
                }
            }
            "accept" => id_arg("accept", rest).map(Command::Accept),
            "reject" => id_arg("reject", rest).map(Command::Reject),
            "cancel" => id_arg("cancel", rest).map(Command::Cancel),
            "status" => Ok(Command::Status),
            "history" => Ok(Command::History),
            "quit" | "exit" => Ok(Command::Quit),
            _ => Err(CommandError::Unknown(verb.to_string())),
        }
    }
}

fn id_arg(verb: &'static str, rest: &str) -> Result<TransferId, CommandError> {
    if rest.is_empty() {
        return Err(CommandError::MissingArgument(verb));
    }
    rest.parse()
        .map_err(|_| CommandError::BadId(rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_spaces() {
        assert_eq!(
            "send  /tmp/my file.txt ".parse::<Command>(),
            Ok(Command::Send(PathBuf::from("/tmp/my file.txt")))
        );
    }

    #[test]
    fn parses_ids() {
        let id = TransferId::new();
        assert_eq!(
            format!("accept {}", id).parse::<Command>(),
            Ok(Command::Accept(id))
        );
        assert_eq!(
            format!("CANCEL {}", id).parse::<Command>(),
            Ok(Command::Cancel(id))
        );
    }

    #[test]
    fn reports_errors() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!(
            "reject".parse::<Command>(),
            Err(CommandError::MissingArgument("reject"))
        );
        assert_eq!(
            "accept 42".parse::<Command>(),
            Err(CommandError::BadId("42".into()))
        );
        assert_eq!(
            "dance".parse::<Command>(),
            Err(CommandError::Unknown("dance".into()))
        );
    }

    #[test]
    fn bare_words() {
        assert_eq!("status".parse::<Command>(), Ok(Command::Status));
        assert_eq!("history".parse::<Command>(), Ok(Command::History));
        assert_eq!("exit".parse::<Command>(), Ok(Command::Quit));
    }
}

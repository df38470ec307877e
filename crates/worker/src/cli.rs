//! Command-line surface.
//!
//! ```text
//! relay-worker                  run the dispatch loop until SIGINT/SIGTERM
//! relay-worker recv|receive     run a single dispatch cycle
//! relay-worker send <text...>   enqueue <text> on the fast queue
//! ```

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    ReceiveOnce,
    /// Enqueue a literal message body.
    Send(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("send needs a message body")]
    EmptySend,

    #[error("unknown command '{0}' (expected send, recv or receive)")]
    Unknown(String),
}

impl Command {
    /// Parse arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);

        let Some(command) = args.next() else {
            return Ok(Self::Run);
        };

        match command.as_str() {
            "recv" | "receive" => Ok(Self::ReceiveOnce),
            "send" => {
                let body = args.collect::<Vec<_>>().join(" ");
                if body.trim().is_empty() {
                    return Err(UsageError::EmptySend);
                }
                Ok(Self::Send(body))
            }
            other => Err(UsageError::Unknown(other.to_string())),
        }
    }
}

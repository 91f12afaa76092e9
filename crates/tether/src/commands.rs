//! Line commands accepted on standard input.
//!
//! Each line holds a verb and, for `request` and `notify`, a method name
//! followed by optional JSON parameters:
//!
//! ```text
//! request textDocument/hover {"position": {"line": 0, "character": 4}}
//! notify workspace/didChangeConfiguration {"settings": {}}
//! restart
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// One parsed host command.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    /// Start the configured language server.
    Start,
    /// Restart the language server.
    Restart,
    /// Stop the language server.
    Stop,
    /// Report the session state.
    State,
    /// Send a request and print its result.
    Request {
        /// LSP method name.
        method: String,
        /// Parameters; `null` when omitted.
        params: Value,
    },
    /// Send a notification.
    Notify {
        /// LSP method name.
        method: String,
        /// Parameters; `null` when omitted.
        params: Value,
    },
    /// Stop the server and exit.
    Quit,
}

impl HostCommand {
    /// Returns the verb that selects this command.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::State => "state",
            Self::Request { .. } => "request",
            Self::Notify { .. } => "notify",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { method, .. } | Self::Notify { method, .. } => {
                write!(f, "{} {method}", self.verb())
            }
            _ => f.write_str(self.verb()),
        }
    }
}

/// Errors raised while parsing a command line.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The line held nothing but whitespace.
    #[error("empty command")]
    Empty,
    /// The verb is not recognised.
    #[error("unknown command {verb:?}; expected start, restart, stop, state, request, notify or quit")]
    Unknown {
        /// The rejected verb.
        verb: String,
    },
    /// `request` or `notify` was given without a method.
    #[error("{verb} requires a method name")]
    MissingMethod {
        /// The verb missing its method.
        verb: &'static str,
    },
    /// A verb that takes no arguments was given some.
    #[error("{verb} takes no arguments")]
    UnexpectedArguments {
        /// The verb given arguments.
        verb: &'static str,
    },
    /// The parameters are not valid JSON.
    #[error("invalid JSON parameters: {source}")]
    InvalidParams {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl FromStr for HostCommand {
    type Err = CommandError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let line = raw.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(head, tail)| (head, tail.trim()));

        let simple = |command: Self| {
            if rest.is_empty() {
                Ok(command)
            } else {
                Err(CommandError::UnexpectedArguments {
                    verb: command.verb(),
                })
            }
        };

        match verb {
            "" => Err(CommandError::Empty),
            "start" => simple(Self::Start),
            "restart" => simple(Self::Restart),
            "stop" => simple(Self::Stop),
            "state" => simple(Self::State),
            "quit" | "exit" => simple(Self::Quit),
            "request" => {
                let (method, params) = method_and_params("request", rest)?;
                Ok(Self::Request { method, params })
            }
            "notify" => {
                let (method, params) = method_and_params("notify", rest)?;
                Ok(Self::Notify { method, params })
            }
            other => Err(CommandError::Unknown {
                verb: other.to_owned(),
            }),
        }
    }
}

fn method_and_params(verb: &'static str, rest: &str) -> Result<(String, Value), CommandError> {
    let (method, raw_params) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(head, tail)| (head, tail.trim()));
    if method.is_empty() {
        return Err(CommandError::MissingMethod { verb });
    }
    let params = if raw_params.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(raw_params).map_err(|source| CommandError::InvalidParams { source })?
    };
    Ok((method.to_owned(), params))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("start", HostCommand::Start)]
    #[case("  restart  ", HostCommand::Restart)]
    #[case("stop", HostCommand::Stop)]
    #[case("state", HostCommand::State)]
    #[case("quit", HostCommand::Quit)]
    #[case("exit", HostCommand::Quit)]
    fn parses_simple_verbs(#[case] line: &str, #[case] expected: HostCommand) {
        assert_eq!(line.parse::<HostCommand>().expect("valid command"), expected);
    }

    #[rstest]
    fn requests_carry_method_and_params() {
        let command: HostCommand = r#"request textDocument/hover {"position": {"line": 1}}"#
            .parse()
            .expect("valid request");

        assert_eq!(
            command,
            HostCommand::Request {
                method: "textDocument/hover".to_owned(),
                params: json!({ "position": { "line": 1 } }),
            }
        );
    }

    #[rstest]
    fn params_default_to_null() {
        let command: HostCommand = "notify initialized".parse().expect("valid notify");

        assert_eq!(
            command,
            HostCommand::Notify {
                method: "initialized".to_owned(),
                params: Value::Null,
            }
        );
    }

    #[rstest]
    #[case("", "empty command")]
    #[case("launch", "unknown command")]
    #[case("request", "requires a method name")]
    #[case("stop now", "takes no arguments")]
    #[case("notify x {oops", "invalid JSON")]
    fn rejects_malformed_lines(#[case] line: &str, #[case] fragment: &str) {
        let error = line.parse::<HostCommand>().expect_err("must fail");

        assert!(
            error.to_string().contains(fragment),
            "{error} should mention {fragment:?}"
        );
    }
}

use nostr::message::MachineReadablePrefix;
use nostr::RelayUrl;
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Cannot connect to relay {url}: {message}"))]
    Connection {
        url: String,
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Connection to {url} closed"))]
    Disconnected { url: String, backtrace: Backtrace },

    #[snafu(display("{message}"))]
    Rejected {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Timed out: {message}"))]
    Timeout {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Auth failed: {message}"))]
    Auth {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("No relays to send to"))]
    NoRelays { backtrace: Backtrace },

    #[snafu(display("Publish failed on every relay: {}", format_failures(failures)))]
    PublishFailed {
        failures: Vec<(RelayUrl, String)>,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid id: {message}"))]
    InvalidId {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid input: {message}"))]
    InvalidInput {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("HTTP error: {message}"))]
    Http {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Nostr error: {message}"))]
    Nostr {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Internal error: {message}"))]
    Internal {
        message: String,
        backtrace: Backtrace,
    },
}

fn format_failures(failures: &[(RelayUrl, String)]) -> String {
    failures
        .iter()
        .map(|(url, reason)| format!("{url}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn connection(url: &RelayUrl, message: impl Into<String>) -> Self {
        Error::Connection {
            url: url.to_string(),
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn disconnected(url: &RelayUrl) -> Self {
        Error::Disconnected {
            url: url.to_string(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Error::Rejected {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Error::Timeout {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Error::Auth {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn no_relays() -> Self {
        Error::NoRelays {
            backtrace: Backtrace::capture(),
        }
    }

    pub fn publish_failed(failures: Vec<(RelayUrl, String)>) -> Self {
        Error::PublishFailed {
            failures,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn invalid_id<S: Into<String>>(message: S) -> Self {
        Error::InvalidId {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Error::InvalidInput {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn http<S: Into<String>>(message: S) -> Self {
        Error::Http {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn nostr(message: impl Into<String>) -> Self {
        Error::Nostr {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    /// The machine-readable prefix of a relay refusal, if it carries one.
    pub fn prefix(&self) -> Option<MachineReadablePrefix> {
        match self {
            Error::Rejected { message, .. } => MachineReadablePrefix::parse(message),
            _ => None,
        }
    }

    /// True when a relay refused the request until the client authenticates.
    pub fn is_auth_required(&self) -> bool {
        self.prefix() == Some(MachineReadablePrefix::AuthRequired)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::http(error.to_string())
    }
}

impl From<nostr::event::builder::Error> for Error {
    fn from(error: nostr::event::builder::Error) -> Self {
        Error::nostr(error.to_string())
    }
}

impl From<nostr::nips::nip19::Error> for Error {
    fn from(error: nostr::nips::nip19::Error) -> Self {
        Error::invalid_id(error.to_string())
    }
}

impl From<nostr::key::Error> for Error {
    fn from(error: nostr::key::Error) -> Self {
        Error::invalid_id(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_required_is_detected_from_prefix() {
        assert!(Error::rejected("auth-required: we only serve members").is_auth_required());
        assert!(!Error::rejected("restricted: not allowed").is_auth_required());
        assert!(!Error::timeout("auth-required").is_auth_required());
    }

    #[test]
    fn refusal_prefixes_follow_the_protocol_list() {
        assert_eq!(
            Error::rejected("unsupported: filter").prefix(),
            Some(MachineReadablePrefix::Unsupported)
        );
        assert_eq!(
            Error::rejected("rate-limited: slow down").prefix(),
            Some(MachineReadablePrefix::RateLimited)
        );
        assert_eq!(Error::rejected("no prefix here").prefix(), None);
        assert_eq!(Error::internal("unsupported: filter").prefix(), None);
    }

    #[test]
    fn publish_failure_lists_every_relay() {
        let failures = vec![
            (
                RelayUrl::parse("wss://a.example").unwrap(),
                "blocked".to_string(),
            ),
            (
                RelayUrl::parse("wss://b.example").unwrap(),
                "Cannot connect to relay".to_string(),
            ),
        ];
        let message = Error::publish_failed(failures).to_string();
        assert!(message.contains("wss://a.example"));
        assert!(message.contains("blocked"));
        assert!(message.contains("Cannot connect to relay"));
    }
}

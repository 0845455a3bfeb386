//! Errors published by protocol servers on their error channel.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything a server (or the wiring layer) can report to the sink.
///
/// Fatal variants terminate the process when they reach the error consumer;
/// the rest are logged and the pipeline keeps running.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// A configured host key file could not be read or parsed.
    #[error("failed to load host key {}: {source}", path.display())]
    HostKeyLoad {
        path: PathBuf,
        source: russh_keys::Error,
    },

    /// Fresh host key generation failed.
    #[error("failed to generate rsa host key")]
    HostKeyGenerate,

    /// A notifier webhook URL did not parse.
    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),

    /// The accept loop hit a non-recoverable error and shut this server down.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

impl ServerError {
    /// Whether the error consumer should terminate the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ServerError::Accept(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_errors_are_not_fatal() {
        let err = ServerError::Accept(io::Error::other("boom"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn bind_and_host_key_and_webhook_errors_are_fatal() {
        let bind = ServerError::Bind {
            addr: "0.0.0.0:22".to_owned(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
        assert!(ServerError::HostKeyGenerate.is_fatal());
        assert!(ServerError::InvalidWebhookUrl("nope".to_owned()).is_fatal());
    }
}

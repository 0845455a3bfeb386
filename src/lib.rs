//! An SSH honeypot: impersonates an SSH server, accepts every password, and
//! records protocol-level interactions (logins, environment variables,
//! commands, shell input, port-forward requests) as structured events on a
//! newline-delimited JSON stream.
//!
//! Servers produce `(event, error)` channel pairs; [`listen_and_log`] merges
//! any number of them into one sink. Fatal errors terminate the process,
//! everything else is logged and survived.

pub mod error;
pub mod event;
pub mod hash;
pub mod notify;
pub mod sink;
pub mod ssh;

pub use error::ServerError;
pub use event::Event;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::sink::EventSink;

/// Wire server streams into the sink and run until the event channels close
/// (in production: forever, or until a fatal error exits the process).
pub async fn listen_and_log<W: AsyncWrite + Unpin>(
    sink: EventSink<W>,
    servers: Vec<(mpsc::Receiver<Event>, mpsc::Receiver<ServerError>)>,
) {
    let (event_streams, error_streams): (Vec<_>, Vec<_>) = servers.into_iter().unzip();
    let events = sink::merge(event_streams);
    let errors = sink::merge(error_streams);
    tokio::spawn(sink::consume_errors(errors));
    sink.consume(events).await;
}

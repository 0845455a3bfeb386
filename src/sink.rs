//! Event/error fan-in and the JSON-line event sink.
//!
//! Any number of servers feed `(event, error)` channel pairs into one merged
//! stream per kind. The single event consumer stamps each record, enriches
//! it with reverse-DNS host names, writes it as one JSON line, and fans it
//! out to the notifiers. The error consumer logs everything and terminates
//! the process on a fatal error.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::error;

use crate::error::ServerError;
use crate::event::Event;
use crate::notify::Notifier;

/// Merge channels of one kind into a single stream: one forwarding task per
/// source. Per-source order is preserved; cross-source interleaving is
/// arbitrary.
pub fn merge<T: Send + 'static>(sources: Vec<mpsc::Receiver<T>>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    for mut source in sources {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
    }
    rx
}

/// Reverse name resolution, injectable so tests stay off the network.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, addr: SocketAddr) -> Option<String>;
}

/// System reverse DNS, run on the blocking pool.
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup(&self, addr: SocketAddr) -> Option<String> {
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr.ip()).ok())
            .await
            .ok()
            .flatten()
    }
}

async fn host_name(resolver: &dyn HostResolver, addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(addr) => resolver
            .lookup(addr)
            .await
            .unwrap_or_else(|| "unknown".to_owned()),
        Err(_) => "unknown".to_owned(),
    }
}

/// Writes enriched events as newline-delimited JSON and fans them out to
/// the notifiers.
pub struct EventSink<W> {
    out: W,
    notifiers: Vec<Arc<dyn Notifier>>,
    resolver: Arc<dyn HostResolver>,
}

impl<W: AsyncWrite + Unpin> EventSink<W> {
    pub fn new(out: W, notifiers: Vec<Arc<dyn Notifier>>, resolver: Arc<dyn HostResolver>) -> Self {
        EventSink {
            out,
            notifiers,
            resolver,
        }
    }

    /// Consume events until the input closes. Single consumer: the writer
    /// sees events in exactly the order the merger delivers them.
    pub async fn consume(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(mut event) = events.recv().await {
            event.stamp(Utc::now());
            event.remote_host_name = host_name(self.resolver.as_ref(), &event.remote_addr).await;
            event.local_host_name = host_name(self.resolver.as_ref(), &event.local_addr).await;

            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "failed to serialize event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = self.write_line(&line).await {
                error!(%err, "failed to write event");
            }

            // Notifiers spawn their own delivery; this loop never waits on them.
            for notifier in &self.notifiers {
                notifier.notify(&event);
            }
        }
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.out.write_all(line).await?;
        self.out.flush().await
    }
}

/// Drain the merged error stream. A fatal error ends the process; the rest
/// are logged and the pipeline keeps running.
pub async fn consume_errors(mut errors: mpsc::Receiver<ServerError>) {
    while let Some(err) = errors.recv().await {
        if err.is_fatal() {
            error!(%err, "fatal server error");
            std::process::exit(1);
        }
        error!(%err, "server error");
    }
}

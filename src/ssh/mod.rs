//! The SSH server: host-key provisioning, the accept loop, and the
//! per-connection lifecycle.
//!
//! `listen_and_serve` is the production entry point; `serve` takes an
//! already-bound listener so tests can use an ephemeral port. Each accepted
//! socket is wrapped in a [`TimedStream`] and handed to russh with a
//! [`SessionHandler`]; the login/logout pair brackets every other event the
//! connection produces.

mod conn;
mod context;
mod session;

pub use conn::TimedStream;
pub use context::{ConnMetadata, SessionContext};
pub use session::{SessionError, SessionHandler};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Config;
use russh::{MethodSet, SshId};
use russh_keys::key::{KeyPair, SignatureHash};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::event::Event;

const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// SSH honeypot server configuration.
pub struct SshServer {
    /// Listen address, `host:port`.
    pub addr: String,
    /// Host key to present. Loaded from `host_key_file` when unset, or a
    /// fresh RSA-4096 key is generated when neither is given.
    pub host_signer: Option<KeyPair>,
    pub host_key_file: Option<PathBuf>,
    /// Sliding per-I/O deadline.
    pub idle_timeout: Duration,
    /// Absolute connection lifetime; zero disables it.
    pub max_timeout: Duration,
    /// Advertised as `SSH-2.0-<version>` when set; library default otherwise.
    pub version: Option<String>,
}

impl Default for SshServer {
    fn default() -> Self {
        SshServer {
            addr: "0.0.0.0:22".to_owned(),
            host_signer: None,
            host_key_file: None,
            idle_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(3600),
            version: None,
        }
    }
}

impl SshServer {
    /// Bind the configured address and serve forever. Returns the event and
    /// error streams; both are rendezvous-sized so a slow consumer
    /// backpressures the protocol tasks rather than dropping observations.
    pub fn listen_and_serve(self) -> (mpsc::Receiver<Event>, mpsc::Receiver<ServerError>) {
        let (event_tx, event_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&self.addr).await {
                Ok(listener) => listener,
                Err(source) => {
                    let _ = err_tx
                        .send(ServerError::Bind {
                            addr: self.addr.clone(),
                            source,
                        })
                        .await;
                    return;
                }
            };
            info!(addr = %self.addr, "starting ssh server");
            self.serve(listener, event_tx, err_tx).await;
        });
        (event_rx, err_rx)
    }

    /// Serve connections from an already-bound listener.
    ///
    /// Host-signer provisioning happens once, before the accept loop.
    /// Transient accept errors back off exponentially (5 ms doubling,
    /// clamped at 1 s, reset on success); anything else is published on the
    /// error channel and ends this server.
    pub async fn serve(
        self,
        listener: TcpListener,
        events: mpsc::Sender<Event>,
        errors: mpsc::Sender<ServerError>,
    ) {
        let signer = match self.provision_signer() {
            Ok(signer) => signer,
            Err(err) => {
                let _ = errors.send(err).await;
                return;
            }
        };
        let config = Arc::new(self.server_config(signer));
        let advertised = match &config.server_id {
            SshId::Standard(id) | SshId::Raw(id) => id.clone(),
        };

        let mut temp_delay = Duration::ZERO;
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    temp_delay = Duration::ZERO;
                    debug!(%peer, "accepted connection");
                    let conn = ConnParams {
                        config: Arc::clone(&config),
                        events: events.clone(),
                        idle_timeout: self.idle_timeout,
                        max_timeout: self.max_timeout,
                        server_version: advertised.clone(),
                    };
                    tokio::spawn(handle_conn(socket, conn));
                }
                Err(err) if is_transient(&err) => {
                    temp_delay = next_backoff(temp_delay);
                    warn!(%err, delay_ms = temp_delay.as_millis() as u64, "transient accept error, backing off");
                    tokio::time::sleep(temp_delay).await;
                }
                Err(err) => {
                    let _ = errors.send(ServerError::Accept(err)).await;
                    return;
                }
            }
        }
    }

    fn provision_signer(&self) -> Result<KeyPair, ServerError> {
        if let Some(signer) = &self.host_signer {
            return Ok(signer.clone());
        }
        match &self.host_key_file {
            Some(path) => {
                russh_keys::load_secret_key(path, None).map_err(|source| ServerError::HostKeyLoad {
                    path: path.clone(),
                    source,
                })
            }
            None => {
                info!("generating rsa host key");
                KeyPair::generate_rsa(4096, SignatureHash::SHA2_512)
                    .ok_or(ServerError::HostKeyGenerate)
            }
        }
    }

    fn server_config(&self, signer: KeyPair) -> Config {
        let mut config = Config::default();
        if let Some(version) = &self.version {
            config.server_id = SshId::Standard(format!("SSH-2.0-{version}"));
        }
        config.methods = MethodSet::PASSWORD;
        config.keys.push(signer);
        config
    }
}

/// Consecutive transient accept errors double the delay, clamped at 1 s.
fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        BACKOFF_INITIAL
    } else {
        (current * 2).min(BACKOFF_MAX)
    }
}

/// Accept errors that resolve themselves; everything else kills this server.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

struct ConnParams {
    config: Arc<Config>,
    events: mpsc::Sender<Event>,
    idle_timeout: Duration,
    max_timeout: Duration,
    server_version: String,
}

/// Drive one accepted socket to completion.
///
/// A connection that never completes its handshake produces no events; once
/// the handshake has succeeded, the logout event is emitted on every exit
/// path, after all of the connection's session events.
async fn handle_conn(socket: TcpStream, params: ConnParams) {
    let (local_addr, remote_addr) = match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(remote)) => (local, remote),
        (Err(err), _) | (_, Err(err)) => {
            debug!(%err, "dropping connection without addresses");
            return;
        }
    };
    let ctx = Arc::new(SessionContext::new(local_addr, remote_addr));
    let stream = TimedStream::new(
        socket,
        params.idle_timeout,
        params.max_timeout,
        ctx.cancel_token(),
    );
    let handler = SessionHandler::new(
        Arc::clone(&ctx),
        params.events.clone(),
        params.server_version,
    );

    match russh::server::run_stream(params.config, stream, handler).await {
        Ok(running) => {
            if let Err(err) = running.await {
                debug!(remote = %remote_addr, %err, "connection ended with error");
            }
        }
        Err(err) => {
            // Port scanners and banner grabbers land here; not worth an event.
            debug!(remote = %remote_addr, %err, "handshake failed");
            return;
        }
    }
    ctx.cancel();
    if ctx.handshake_complete() {
        let logout = ctx.event("logout".to_owned(), serde_json::Value::Object(serde_json::Map::new()));
        let _ = params.events.send(logout).await;
    }
}

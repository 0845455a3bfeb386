//! Per-connection identity state shared between the accept task and the
//! protocol handler.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::Event;
use crate::hash;

/// Connection metadata applied once the handshake has succeeded.
#[derive(Debug)]
pub struct ConnMetadata {
    pub user: String,
    pub client_version: String,
    pub server_version: String,
}

#[derive(Debug, Default)]
struct Identity {
    user: Option<String>,
    password: Option<String>,
    session_id: Option<String>,
    client_version: Option<String>,
    server_version: Option<String>,
}

/// One per accepted TCP connection: addresses, negotiated identity, and the
/// cancellation signal observed by everything scoped to the connection.
///
/// Identity writes happen on one task at a time (password callback, then
/// handshake completion), so the mutex is uncontended.
#[derive(Debug)]
pub struct SessionContext {
    /// Random per-connection nonce the correlation id is derived from.
    nonce: [u8; 16],
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    identity: Mutex<Identity>,
    cancel: CancellationToken,
}

impl SessionContext {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        SessionContext {
            nonce: *Uuid::new_v4().as_bytes(),
            local_addr,
            remote_addr,
            identity: Mutex::new(Identity::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Store the negotiated connection metadata and derive the session id
    /// from the connection nonce. A second call is a no-op.
    pub fn apply_conn_metadata(&self, meta: ConnMetadata) {
        let mut identity = self.lock();
        if identity.session_id.is_some() {
            return;
        }
        identity.session_id = Some(hash::short_digest(&self.nonce));
        identity.user = Some(meta.user);
        identity.client_version = Some(meta.client_version);
        identity.server_version = Some(meta.server_version);
    }

    /// Record the password offered during authentication.
    pub fn apply_password(&self, password: &str) {
        self.lock().password = Some(password.to_owned());
    }

    /// True once `apply_conn_metadata` has run, i.e. the handshake succeeded.
    pub fn handshake_complete(&self) -> bool {
        self.lock().session_id.is_some()
    }

    pub fn user(&self) -> String {
        self.lock().user.clone().expect("user set during handshake")
    }

    pub fn password(&self) -> String {
        self.lock()
            .password
            .clone()
            .expect("password set during handshake")
    }

    pub fn session_id(&self) -> String {
        self.lock()
            .session_id
            .clone()
            .expect("session id set during handshake")
    }

    pub fn client_version(&self) -> String {
        self.lock()
            .client_version
            .clone()
            .expect("client version set during handshake")
    }

    pub fn server_version(&self) -> String {
        self.lock()
            .server_version
            .clone()
            .expect("server version set during handshake")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Token handed to the socket wrapper; cancelled when the connection
    /// closes for any reason.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Skeleton event carrying this connection's correlation fields. The
    /// sink fills in the time and host name fields later.
    pub fn event(&self, summary: String, data: serde_json::Value) -> Event {
        Event {
            unix_time: 0,
            timestamp: String::new(),
            correlation_id: self.session_id(),
            remote_addr: self.remote_addr.to_string(),
            remote_host_name: String::new(),
            local_addr: self.local_addr.to_string(),
            local_host_name: String::new(),
            kind: "ssh".to_owned(),
            summary,
            data,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().expect("session context mutex poisoned")
    }
}

//! Per-connection protocol handler.
//!
//! Every password is accepted, and every observable request (environment
//! variables, exec commands, shell input, port-forward requests) becomes
//! exactly one [`Event`] on the server's event channel. Nothing is actually
//! executed or forwarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::event::Event;
use crate::ssh::context::{ConnMetadata, SessionContext};

/// Response for any command beginning with `uname`. Prefix match is
/// deliberate: `uname && rm -rf /` still gets the canned line.
const UNAME: &str = "Linux host 4.4.0-1022 #31-Ubuntu SMP Tue Jun 27 11:27:55 UTC 2017 x86_64 x86_64 x86_64 GNU/Linux\n";

const SHELL_PROMPT: &str = "$ ";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    /// The sink side of the event channel is gone; nothing left to observe for.
    #[error("event channel closed")]
    EventChannelClosed,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginData {
    client_version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EnvData {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecData {
    command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ForwardData {
    bind_address: String,
    bind_port: u32,
}

fn payload<T: Serialize>(data: &T) -> Value {
    serde_json::to_value(data).expect("event payload serializes")
}

/// Accumulates raw shell input and yields completed lines. `\n` and `\r`
/// both terminate a line; a CRLF pair yields a single line.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
    last_was_cr: bool,
}

impl LineBuffer {
    fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\n' if self.last_was_cr => self.last_was_cr = false,
                b'\n' | b'\r' => {
                    self.last_was_cr = byte == b'\r';
                    lines.push(String::from_utf8_lossy(&self.buf).into_owned());
                    self.buf.clear();
                }
                _ => {
                    self.last_was_cr = false;
                    self.buf.push(byte);
                }
            }
        }
        lines
    }
}

/// One handler per accepted connection, driven by russh's session task.
pub struct SessionHandler {
    ctx: Arc<SessionContext>,
    events: mpsc::Sender<Event>,
    server_version: String,
    pending_user: Option<String>,
    shells: HashSet<ChannelId>,
    line_bufs: HashMap<ChannelId, LineBuffer>,
}

impl SessionHandler {
    pub fn new(
        ctx: Arc<SessionContext>,
        events: mpsc::Sender<Event>,
        server_version: String,
    ) -> Self {
        SessionHandler {
            ctx,
            events,
            server_version,
            pending_user: None,
            shells: HashSet::new(),
            line_bufs: HashMap::new(),
        }
    }

    /// Send one observation into the pipeline. The channel is rendezvous
    /// sized, so a slow sink backpressures this connection.
    async fn emit(&self, summary: String, data: Value) -> Result<(), SessionError> {
        let event = self.ctx.event(summary, data);
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::EventChannelClosed)
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = SessionError;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<Auth, Self::Error> {
        // Everyone gets in. That is the point.
        self.pending_user = Some(user.to_owned());
        self.ctx.apply_password(password);
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let user = self.pending_user.take().unwrap_or_default();
        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        self.ctx.apply_conn_metadata(ConnMetadata {
            user,
            client_version,
            server_version: self.server_version.clone(),
        });
        let summary = format!(
            "login username: {}, password: {}",
            self.ctx.user(),
            self.ctx.password()
        );
        let data = payload(&LoginData {
            client_version: self.ctx.client_version(),
        });
        self.emit(summary, data).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(correlation_id = %self.ctx.session_id(), channel = %channel.id(), "session channel opened");
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.emit(
            format!("env {variable_name}={variable_value}"),
            payload(&EnvData {
                key: variable_name.to_owned(),
                value: variable_value.to_owned(),
            }),
        )
        .await?;
        session.channel_success(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        match std::str::from_utf8(data) {
            Ok(command) => {
                if command.starts_with("uname") {
                    session.data(channel, CryptoVec::from_slice(UNAME.as_bytes()));
                }
                self.emit(
                    format!("command {command}"),
                    payload(&ExecData {
                        command: command.to_owned(),
                    }),
                )
                .await?;
            }
            Err(err) => {
                error!(correlation_id = %self.ctx.session_id(), %err, "failed to decode exec command");
            }
        }
        // Every command "succeeds", decodable or not.
        session.exit_status_request(channel, 0);
        session.close(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shells.insert(channel);
        self.line_bufs.insert(channel, LineBuffer::default());
        session.channel_success(channel);
        session.data(channel, CryptoVec::from_slice(SHELL_PROMPT.as_bytes()));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Only shell input is observed; exec stdin is discarded.
        if !self.shells.contains(&channel) {
            return Ok(());
        }
        session.data(channel, CryptoVec::from_slice(data));
        let lines = self
            .line_bufs
            .get_mut(&channel)
            .map(|buf| buf.feed(data))
            .unwrap_or_default();
        for line in lines {
            self.emit(format!("shell {line}"), Value::String(line)).await?;
            session.data(channel, CryptoVec::from_slice(SHELL_PROMPT.as_bytes()));
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.shells.remove(&channel) {
            self.line_bufs.remove(&channel);
            session.close(channel);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shells.remove(&channel);
        self.line_bufs.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Recorded, never opened.
        let bind_port = *port;
        self.emit(
            format!("port forward {address}:{bind_port}"),
            payload(&ForwardData {
                bind_address: address.to_owned(),
                bind_port,
            }),
        )
        .await?;
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Not emulated, but answered success so clients proceed to shell/exec.
        debug!(correlation_id = %self.ctx.session_id(), %term, "pty requested");
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(correlation_id = %self.ctx.session_id(), %name, "subsystem requested");
        session.channel_success(channel);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_lf() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.feed(b"whoami\nexit\n"), vec!["whoami", "exit"]);
    }

    #[test]
    fn line_buffer_counts_crlf_once() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.feed(b"whoami\r\nexit\r\n"), vec!["whoami", "exit"]);
    }

    #[test]
    fn line_buffer_splits_on_bare_cr() {
        let mut buf = LineBuffer::default();
        assert_eq!(buf.feed(b"whoami\rexit\r"), vec!["whoami", "exit"]);
    }

    #[test]
    fn line_buffer_keeps_partial_input() {
        let mut buf = LineBuffer::default();
        assert!(buf.feed(b"who").is_empty());
        assert_eq!(buf.feed(b"ami\n"), vec!["whoami"]);
    }

    #[test]
    fn line_buffer_is_lossy_on_invalid_utf8() {
        let mut buf = LineBuffer::default();
        let lines = buf.feed(b"id\xff\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("id"));
    }

    #[test]
    fn payloads_serialize_with_wire_field_names() {
        let data = payload(&ForwardData {
            bind_address: "0.0.0.0".to_owned(),
            bind_port: 8080,
        });
        assert_eq!(
            data,
            serde_json::json!({"BindAddress": "0.0.0.0", "BindPort": 8080})
        );
        let login = payload(&LoginData {
            client_version: "SSH-2.0-OpenSSH_9.6".to_owned(),
        });
        assert_eq!(
            login,
            serde_json::json!({"ClientVersion": "SSH-2.0-OpenSSH_9.6"})
        );
    }
}

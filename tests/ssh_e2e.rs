//! End-to-end scenarios: a real SSH client against a served listener.
//!
//! Each test binds an ephemeral port, runs the honeypot's serve loop on it,
//! and drives it with a russh client, asserting on the exact event sequence
//! the server pushes into its event channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key::{KeyPair, PublicKey};
use serde_json::json;
use sshtrap::error::ServerError;
use sshtrap::event::Event;
use sshtrap::ssh::SshServer;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CANNED_UNAME: &str = "Linux host 4.4.0-1022 #31-Ubuntu SMP Tue Jun 27 11:27:55 UTC 2017 x86_64 x86_64 x86_64 GNU/Linux\n";

struct TrustingClient;

#[async_trait]
impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Honeypot with test-friendly timeouts and a cheap host key.
fn test_server(addr: String, idle_timeout: Duration) -> SshServer {
    SshServer {
        addr,
        host_signer: Some(KeyPair::generate_ed25519().expect("ed25519 keygen")),
        idle_timeout,
        max_timeout: Duration::from_secs(3600),
        ..SshServer::default()
    }
}

/// Bind an ephemeral port, start the serve loop, and drain its event stream
/// into an unbounded collector so the rendezvous channel never stalls a test.
async fn start_honeypot(idle_timeout: Duration) -> (std::net::SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (event_tx, mut event_rx) = mpsc::channel(1);
    let (err_tx, _err_rx) = mpsc::channel(1);
    tokio::spawn(test_server(addr.to_string(), idle_timeout).serve(listener, event_tx, err_tx));

    let (tx, collected) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if tx.send(event).is_err() {
                return;
            }
        }
    });
    (addr, collected)
}

async fn connect(addr: std::net::SocketAddr) -> client::Handle<TrustingClient> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, addr, TrustingClient)
        .await
        .expect("connect");
    let authenticated = session
        .authenticate_password("root", "toor")
        .await
        .expect("auth exchange");
    assert!(authenticated, "honeypot must accept any password");
    session
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("event within deadline")
        .expect("event stream open")
}

fn assert_correlated(events: &[&Event]) {
    let id = &events[0].correlation_id;
    assert_eq!(id.len(), 7);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    for event in events {
        assert_eq!(&event.correlation_id, id, "one correlation id per connection");
        assert_eq!(event.kind, "ssh");
        assert!(!event.remote_addr.is_empty());
        assert!(!event.local_addr.is_empty());
        assert_eq!(event.unix_time, 0, "time stamping is the sink's job");
        assert!(event.timestamp.is_empty());
    }
}

// ---------------------------------------------------------------------------
// S1: exec uname -a
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exec_uname_gets_canned_reply_and_event_bracket() {
    let (addr, mut events) = start_honeypot(Duration::from_secs(10)).await;
    let mut session = connect(addr).await;

    let mut channel = session.channel_open_session().await.expect("open session");
    channel.exec(true, "uname -a").await.expect("exec");

    let mut output = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    assert_eq!(String::from_utf8_lossy(&output), CANNED_UNAME);
    assert_eq!(exit_status, Some(0), "every exec reports success");

    session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
        .ok();

    let login = next_event(&mut events).await;
    let exec = next_event(&mut events).await;
    let logout = next_event(&mut events).await;

    assert_eq!(login.summary, "login username: root, password: toor");
    let client_version = login.data["ClientVersion"].as_str().expect("client version");
    assert!(client_version.starts_with("SSH-2.0-"), "got {client_version}");

    assert_eq!(exec.summary, "command uname -a");
    assert_eq!(exec.data, json!({"Command": "uname -a"}));

    assert_eq!(logout.summary, "logout");
    assert_eq!(logout.data, json!({}));

    assert_correlated(&[&login, &exec, &logout]);
}

// ---------------------------------------------------------------------------
// S2: env before exec, no canned output for other commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn env_and_plain_exec_are_recorded_in_order() {
    let (addr, mut events) = start_honeypot(Duration::from_secs(10)).await;
    let mut session = connect(addr).await;

    let mut channel = session.channel_open_session().await.expect("open session");
    channel
        .set_env(true, "LANG", "en_US.UTF-8")
        .await
        .expect("env");
    channel.exec(true, "ls").await.expect("exec");

    let mut output = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    assert!(output.is_empty(), "only uname gets a canned reply");

    session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
        .ok();

    let login = next_event(&mut events).await;
    let env = next_event(&mut events).await;
    let exec = next_event(&mut events).await;
    let logout = next_event(&mut events).await;

    assert_eq!(login.summary, "login username: root, password: toor");
    assert_eq!(env.summary, "env LANG=en_US.UTF-8");
    assert_eq!(env.data, json!({"Key": "LANG", "Value": "en_US.UTF-8"}));
    assert_eq!(exec.summary, "command ls");
    assert_eq!(exec.data, json!({"Command": "ls"}));
    assert_eq!(logout.summary, "logout");

    assert_correlated(&[&login, &env, &exec, &logout]);
}

// ---------------------------------------------------------------------------
// S3: tcpip-forward is recorded but never opened
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcpip_forward_is_recorded_only() {
    let (addr, mut events) = start_honeypot(Duration::from_secs(10)).await;
    let mut session = connect(addr).await;

    session
        .tcpip_forward("0.0.0.0", 8080)
        .await
        .expect("forward request accepted");

    session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
        .ok();

    let login = next_event(&mut events).await;
    let forward = next_event(&mut events).await;
    let logout = next_event(&mut events).await;

    assert_eq!(forward.summary, "port forward 0.0.0.0:8080");
    assert_eq!(forward.data, json!({"BindAddress": "0.0.0.0", "BindPort": 8080}));
    assert_eq!(logout.summary, "logout");

    assert_correlated(&[&login, &forward, &logout]);
}

// ---------------------------------------------------------------------------
// S4: shell input, one event per line
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shell_lines_become_events() {
    let (addr, mut events) = start_honeypot(Duration::from_secs(10)).await;
    let mut session = connect(addr).await;

    let mut channel = session.channel_open_session().await.expect("open session");
    channel.request_shell(true).await.expect("shell");
    channel
        .data(&b"whoami\nexit\n"[..])
        .await
        .expect("send shell input");
    channel.eof().await.expect("eof");

    while let Some(msg) = channel.wait().await {
        if matches!(msg, ChannelMsg::Close) {
            break;
        }
    }
    session
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
        .ok();

    let login = next_event(&mut events).await;
    let whoami = next_event(&mut events).await;
    let exit = next_event(&mut events).await;
    let logout = next_event(&mut events).await;

    assert_eq!(whoami.summary, "shell whoami");
    assert_eq!(whoami.data, json!("whoami"));
    assert_eq!(exit.summary, "shell exit");
    assert_eq!(exit.data, json!("exit"));
    assert_eq!(logout.summary, "logout");

    assert_correlated(&[&login, &whoami, &exit, &logout]);
}

// ---------------------------------------------------------------------------
// S5: a silent client is cut off with no events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_connection_times_out_without_events() {
    let (addr, mut events) = start_honeypot(Duration::from_millis(200)).await;

    let mut socket = TcpStream::connect(addr).await.expect("tcp connect");
    // Never send a banner; the idle deadline must cut us off.
    let mut buf = [0u8; 256];
    let disconnected = async {
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {} // server banner
            }
        }
    };
    timeout(Duration::from_secs(5), disconnected)
        .await
        .expect("connection closed by idle deadline");

    // Handshake never completed: no login, no logout, nothing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err(), "no events for a failed handshake");
}

// ---------------------------------------------------------------------------
// Host key provisioning failures are fatal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unparseable_host_key_file_is_fatal() {
    use std::io::Write as _;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "this is not a private key").expect("write junk");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let (event_tx, _event_rx) = mpsc::channel(1);
    let (err_tx, mut errors) = mpsc::channel(1);
    let server = SshServer {
        host_key_file: Some(file.path().to_path_buf()),
        ..SshServer::default()
    };
    tokio::spawn(server.serve(listener, event_tx, err_tx));

    let err = timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("error within deadline")
        .expect("one error");
    assert!(matches!(err, ServerError::HostKeyLoad { .. }), "got {err}");
    assert!(err.is_fatal());
}

// ---------------------------------------------------------------------------
// S6: bind failure is one fatal error and no events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bind_failure_is_fatal_on_the_error_stream() {
    let occupier = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = occupier.local_addr().expect("local addr");

    let server = test_server(addr.to_string(), Duration::from_secs(10));
    let (mut events, mut errors) = server.listen_and_serve();

    let err = timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("error within deadline")
        .expect("one error");
    assert!(matches!(err, ServerError::Bind { .. }), "got {err}");
    assert!(err.is_fatal());

    let closed = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event stream resolves");
    assert!(closed.is_none(), "no events after a failed bind");
}

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tracing::error;

use sshtrap::notify::{Notifier, SlackNotifier};
use sshtrap::sink::{DnsResolver, EventSink};
use sshtrap::ssh::SshServer;

#[tokio::main]
async fn main() {
    let matches = Command::new("sshtrap")
        .about("An SSH honeypot that accepts every login and records what happens next")
        .disable_version_flag(true)
        .arg(
            Arg::new("ssh_port")
                .help("The port to listen on for ssh traffic")
                .long("ssh-port")
                .value_parser(clap::value_parser!(u16))
                .default_value("22"),
        )
        .arg(
            Arg::new("ssh_host_key_file")
                .help("Path to the ssh host key file. A fresh RSA key is generated if absent")
                .long("ssh-host-key-file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("slack_url")
                .help("Slack webhook url to notify for every event")
                .long("slack-url"),
        )
        .arg(
            Arg::new("version")
                .help("Print version and exit")
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("version") {
        eprintln!("{}", env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    // Operational log: JSON lines on stderr. Events go to stdout.
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(url) = matches.get_one::<String>("slack_url") {
        match SlackNotifier::new(url) {
            Ok(notifier) => notifiers.push(Arc::new(notifier)),
            Err(err) => {
                error!(%err, "refusing to start without a working notifier");
                process::exit(1);
            }
        }
    }

    let port = matches
        .get_one::<u16>("ssh_port")
        .expect("ssh-port has a default");
    let server = SshServer {
        addr: format!("0.0.0.0:{port}"),
        host_key_file: matches.get_one::<PathBuf>("ssh_host_key_file").cloned(),
        idle_timeout: Duration::from_secs(10),
        max_timeout: Duration::from_secs(3600),
        ..SshServer::default()
    };

    let streams = server.listen_and_serve();
    let sink = EventSink::new(tokio::io::stdout(), notifiers, Arc::new(DnsResolver));
    sshtrap::listen_and_log(sink, vec![streams]).await;
}
